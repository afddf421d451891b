// rust/reshard-core/src/engine/gather.rs

//! Streaming reassembly of full tensors on every rank.
//!
//! [`FullParamGather`] yields each tensor as soon as all of its shards have
//! arrived, and drops a local shard as soon as every tensor built from it is
//! complete, so at most a few full tensors are alive at once.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info};

use crate::comm::{all_gather_object, Collective};
use crate::config::LoadConfig;
use crate::engine::executor::{lookup_source, SourceTensors};
use crate::engine::release::ReleaseTracker;
use crate::engine::reshard::virtual_file_name;
use crate::error::{ReshardError, Result, ShardingError};
use crate::plan::{sort_items, ReadItem};
use crate::shard::integrity::validate_source_layout;
use crate::shard::{LocalTensorIndex, LocalTensorMetadata, ShardInfo, ShardLayout, ShardedStateDict};
use crate::tensor::{DType, Tensor};
use crate::transfer::TransferBuffer;

/// Work that still needs a local shard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Consumer {
    /// Assembling this tensor on the local rank.
    Assemble(String),
    /// Sending the shard to the other ranks.
    Send(LocalTensorIndex),
}

#[derive(Debug)]
struct GatherTarget {
    global_shape: Vec<u64>,
    dtype: DType,
    tensor: Option<Tensor>,
    remaining: usize,
}

/// Iterator over `(name, full tensor)` pairs, identical on every rank.
///
/// Every rank must drive the iterator to the end in lockstep since each step
/// may issue a broadcast. After an error the iterator is exhausted.
pub struct FullParamGather<'a> {
    comm: &'a dyn Collective,
    config: &'a LoadConfig,
    items: VecDeque<ReadItem>,
    sources: SourceTensors,
    targets: BTreeMap<String, GatherTarget>,
    tracker: ReleaseTracker<LocalTensorIndex, Consumer>,
    buffer: TransferBuffer,
    ready: VecDeque<String>,
    failed: bool,
}

impl<'a> FullParamGather<'a> {
    /// Plans the gather of every tensor in the union of all ranks' shards.
    ///
    /// # Errors
    ///
    /// Returns [`ShardingError::FlattenedShard`] if any shard is flattened,
    /// or a coverage error if the shards of a tensor leave a gap or overlap.
    pub fn new(
        comm: &'a dyn Collective,
        config: &'a LoadConfig,
        state_dict: ShardedStateDict,
    ) -> Result<Self> {
        if let Some(shard) = state_dict.values().find(|s| s.is_flattened()) {
            return Err(ShardingError::FlattenedShard {
                key: shard.desc.key.clone(),
            }
            .into());
        }
        let rank = comm.rank();
        let world = comm.world_size();

        let local: Vec<(String, LocalTensorMetadata)> = state_dict
            .values()
            .map(|shard| (shard.desc.key.clone(), LocalTensorMetadata::from_shard(shard)))
            .collect();
        let mut holders: BTreeMap<LocalTensorIndex, (u32, String, LocalTensorMetadata)> =
            BTreeMap::new();
        for (holder, shards) in (0u32..).zip(all_gather_object(comm, &local, None)?) {
            for (key, meta) in shards {
                holders
                    .entry(LocalTensorIndex::for_meta(key.clone(), &meta))
                    .or_insert((holder, key, meta));
            }
        }
        let mut layout = ShardLayout::new();
        for (key, meta) in holders.values().map(|(_, key, meta)| (key, meta)) {
            layout.entry(key.clone()).or_default().push(ShardInfo {
                desc: meta.to_descriptor(key.clone()),
                is_flattened: false,
            });
        }
        validate_source_layout(&layout)?;

        let mut items = Vec::new();
        let mut targets: BTreeMap<String, GatherTarget> = BTreeMap::new();
        let mut tracker = ReleaseTracker::new();
        for (idx, (holder, key, meta)) in &holders {
            let local_item = ReadItem {
                tensor_name: key.clone(),
                src_global_offset: meta.global_offset.clone(),
                dst_global_offset: vec![0; meta.global_shape.len()],
                src_rank: *holder,
                dst_rank: vec![*holder],
                src_local_offset: vec![0; meta.local_shape.len()],
                dst_local_offset: meta.global_offset.clone(),
                slice_shape: meta.local_shape.clone(),
                file_name: virtual_file_name(*holder),
                dtype: meta.dtype,
                comm_group: None,
            };
            let others: Vec<u32> = (0..world).filter(|r| r != holder).collect();
            if !others.is_empty() {
                items.push(ReadItem {
                    dst_rank: others,
                    ..local_item.clone()
                });
                if *holder == rank {
                    tracker.track(idx.clone(), Consumer::Send(idx.clone()));
                }
            }
            items.push(local_item);

            targets
                .entry(key.clone())
                .or_insert_with(|| GatherTarget {
                    global_shape: meta.global_shape.clone(),
                    dtype: meta.dtype,
                    tensor: None,
                    remaining: 0,
                })
                .remaining += 1;
            if *holder == rank {
                tracker.track(idx.clone(), Consumer::Assemble(key.clone()));
            }
        }
        sort_items(&mut items);

        let sources: SourceTensors = state_dict
            .into_values()
            .map(|shard| {
                let idx = LocalTensorIndex::for_meta(
                    shard.desc.key.clone(),
                    &LocalTensorMetadata::from_shard(&shard),
                );
                (idx, shard.tensor)
            })
            .filter(|(idx, _)| holders.get(idx).is_some_and(|(holder, ..)| *holder == rank))
            .collect();

        let largest = items.iter().map(ReadItem::numel).max().unwrap_or(0);
        info!(
            rank,
            tensors = targets.len(),
            items = items.len(),
            "planned full parameter gather"
        );
        Ok(Self {
            comm,
            config,
            items: items.into(),
            sources,
            targets,
            tracker,
            buffer: TransferBuffer::sized_for(
                config.packed_dtype,
                largest,
                config.transfer_buffer_floor,
            ),
            ready: VecDeque::new(),
            failed: false,
        })
    }

    /// Local shards not yet released.
    pub fn held_sources(&self) -> usize {
        self.sources.len()
    }

    fn packable(&self, item: &ReadItem) -> bool {
        self.config.pack_transfers && item.dtype == self.config.packed_dtype && !item.is_local()
    }

    fn step(&mut self) -> Result<()> {
        let Some(front) = self.items.front() else {
            return Ok(());
        };
        if self.packable(front) {
            self.step_packed()
        } else if let Some(item) = self.items.pop_front() {
            self.step_single(&item)
        } else {
            Ok(())
        }
    }

    /// Moves one item, by local copy or broadcast.
    fn step_single(&mut self, item: &ReadItem) -> Result<()> {
        let rank = self.comm.rank();
        if item.is_local() {
            if item.src_rank == rank {
                let piece = lookup_source(&self.sources, item)?
                    .slice(&item.src_local_offset, &item.slice_shape)?;
                self.deliver(item, &piece)?;
            }
            return Ok(());
        }

        let mut bytes = if rank == item.src_rank {
            lookup_source(&self.sources, item)?
                .slice(&item.src_local_offset, &item.slice_shape)?
                .into_bytes()
        } else {
            vec![0u8; item.nbytes()]
        };
        self.comm.broadcast(&mut bytes, item.src_rank, None)?;
        if item.dst_rank.contains(&rank) {
            let piece = Tensor::new(item.dtype, item.slice_shape.clone(), bytes)?;
            self.deliver(item, &piece)?;
        }
        self.sent(item);
        Ok(())
    }

    /// Packs every queued item of the front item's source that fits, in
    /// queue order, into one broadcast.
    fn step_packed(&mut self) -> Result<()> {
        let rank = self.comm.rank();
        let Some(src) = self.items.front().map(|item| item.src_rank) else {
            return Ok(());
        };

        self.buffer.clear();
        let mut batch = Vec::new();
        let mut rest = VecDeque::with_capacity(self.items.len());
        let mut full = false;
        while let Some(item) = self.items.pop_front() {
            if !full && item.src_rank == src && self.packable(&item) {
                let fits = if rank == src {
                    let slice = lookup_source(&self.sources, &item)?
                        .slice(&item.src_local_offset, &item.slice_shape)?;
                    self.buffer.append(&slice)?
                } else {
                    self.buffer.append_placeholder(&item.slice_shape)
                };
                if fits {
                    batch.push(item);
                    continue;
                }
                full = true;
            }
            rest.push_back(item);
        }
        self.items = rest;

        self.comm.broadcast(self.buffer.as_bytes_mut(), src, None)?;
        debug!(src, items = batch.len(), "packed broadcast");
        let pieces = self.buffer.recover()?;
        for (item, piece) in batch.iter().zip(pieces) {
            if item.dst_rank.contains(&rank) {
                self.deliver(item, &piece)?;
            }
            self.sent(item);
        }
        Ok(())
    }

    fn deliver(&mut self, item: &ReadItem, piece: &Tensor) -> Result<()> {
        let target = self.targets.get_mut(&item.tensor_name).ok_or_else(|| {
            ReshardError::tensor(format!("no gather target for '{}'", item.tensor_name))
        })?;
        if target.tensor.is_none() {
            target.tensor = Some(Tensor::zeros(target.dtype, target.global_shape.clone()));
        }
        if let Some(tensor) = target.tensor.as_mut() {
            tensor.assign(&item.dst_local_offset, piece)?;
        }
        target.remaining = target.remaining.saturating_sub(1);

        if target.remaining == 0 {
            self.ready.push_back(item.tensor_name.clone());
            let done = Consumer::Assemble(item.tensor_name.clone());
            self.release(&done);
        }
        Ok(())
    }

    fn sent(&mut self, item: &ReadItem) {
        if item.src_rank == self.comm.rank() {
            let idx = LocalTensorIndex::new(item.tensor_name.clone(), item.src_global_offset.clone());
            self.release(&Consumer::Send(idx));
        }
    }

    fn release(&mut self, consumer: &Consumer) {
        for idx in self.tracker.complete(consumer) {
            debug!(tensor = %idx.tensor_key, "released local shard");
            self.sources.remove(&idx);
        }
    }
}

impl Iterator for FullParamGather<'_> {
    type Item = Result<(String, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(name) = self.ready.pop_front() {
                let target = self.targets.remove(&name)?;
                let tensor = target
                    .tensor
                    .unwrap_or_else(|| Tensor::zeros(target.dtype, target.global_shape));
                return Some(Ok((name, tensor)));
            }
            if self.failed || self.items.is_empty() {
                return None;
            }
            if let Err(err) = self.step() {
                self.failed = true;
                return Some(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalMesh, SoloCollective};
    use crate::shard::placement::shard_full_tensor;
    use crate::shard::{FlatRange, Placement, ProcessMesh, ShardDescriptor, ShardedTensor, TensorKey};

    fn arange(shape: Vec<u64>, start: f32) -> Tensor {
        let n: u64 = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|v| start + v as f32).collect();
        Tensor::from_f32(shape, &values).unwrap()
    }

    fn gather_all(world: u32, config: LoadConfig) -> Vec<Vec<(String, Tensor)>> {
        let w = arange(vec![6, 3], 0.0);
        let b = arange(vec![5], 100.0);
        let mesh = ProcessMesh::linear(world);
        std::thread::scope(|s| {
            let handles: Vec<_> = LocalMesh::new(world)
                .into_iter()
                .map(|comm| {
                    let (w, b, mesh, config) = (&w, &b, &mesh, &config);
                    s.spawn(move || {
                        let rank = comm.rank();
                        let mut sd = ShardedStateDict::new();
                        for (name, full, placement) in
                            [("w", w, Placement::Shard(0)), ("b", b, Placement::Replicate)]
                        {
                            if let Some(shard) =
                                shard_full_tensor(name, full, mesh, &[placement], rank).unwrap()
                            {
                                sd.insert(TensorKey::from(name), shard);
                            }
                        }
                        FullParamGather::new(&comm, config, sd)
                            .unwrap()
                            .collect::<Result<Vec<_>>>()
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_every_rank_gets_full_tensors() {
        for per_rank in gather_all(3, LoadConfig::default()) {
            let gathered: BTreeMap<String, Tensor> = per_rank.into_iter().collect();
            assert_eq!(gathered.len(), 2);
            assert_eq!(gathered["w"], arange(vec![6, 3], 0.0));
            assert_eq!(gathered["b"], arange(vec![5], 100.0));
        }
    }

    #[test]
    fn test_packed_transfers() {
        let config = LoadConfig {
            packed_dtype: DType::F32,
            transfer_buffer_floor: 4,
            ..LoadConfig::default()
        };
        let outputs = gather_all(2, config);
        assert_eq!(outputs[0], outputs[1]);
        let gathered: BTreeMap<String, Tensor> = outputs[0].iter().cloned().collect();
        assert_eq!(gathered["w"], arange(vec![6, 3], 0.0));
        assert_eq!(gathered["b"], arange(vec![5], 100.0));
    }

    #[test]
    fn test_solo_releases_sources() {
        let config = LoadConfig::default();
        let mut sd = ShardedStateDict::new();
        let desc = ShardDescriptor::unsharded("x", vec![2, 2], DType::F32);
        sd.insert(
            TensorKey::from("x"),
            ShardedTensor::new(desc, arange(vec![2, 2], 1.0)).unwrap(),
        );

        let mut gather = FullParamGather::new(&SoloCollective, &config, sd).unwrap();
        assert_eq!(gather.held_sources(), 1);
        let (name, tensor) = gather.next().unwrap().unwrap();
        assert_eq!(name, "x");
        assert_eq!(tensor, arange(vec![2, 2], 1.0));
        assert_eq!(gather.held_sources(), 0);
        assert!(gather.next().is_none());
    }

    #[test]
    fn test_flattened_shards_rejected() {
        let config = LoadConfig::default();
        let mut sd = ShardedStateDict::new();
        let desc = ShardDescriptor::unsharded("x", vec![4], DType::F32);
        sd.insert(
            TensorKey::from("x"),
            ShardedTensor::flattened(desc, arange(vec![2], 0.0), FlatRange::new(0, 2)).unwrap(),
        );
        let err = FullParamGather::new(&SoloCollective, &config, sd).err().unwrap();
        assert!(matches!(err, ReshardError::Sharding(ShardingError::FlattenedShard { .. })));
    }

    #[test]
    fn test_partial_coverage_rejected() {
        let config = LoadConfig::default();
        let mut sd = ShardedStateDict::new();
        let desc = ShardDescriptor::new("x", vec![2, 8], vec![4, 8], vec![0, 0], DType::F32);
        sd.insert(
            TensorKey::from("x"),
            ShardedTensor::new(desc, arange(vec![2, 8], 0.0)).unwrap(),
        );
        let err = FullParamGather::new(&SoloCollective, &config, sd).err().unwrap();
        assert!(matches!(err, ReshardError::Sharding(ShardingError::Gap { .. })));
    }
}
