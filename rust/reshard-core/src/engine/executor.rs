// rust/reshard-core/src/engine/executor.rs

//! Runs one planned epoch: local copies first, then communication batches.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::comm::{CommGroup, Collective};
use crate::config::LoadConfig;
use crate::engine::release::ReleaseTracker;
use crate::error::{ReshardError, Result};
use crate::plan::{get_read_items, LoadInfos, ReadItem};
use crate::schedule::EpochSchedule;
use crate::shard::{LocalTensorIndex, MetadataIndex, ShardDescriptor, ShardedStateDict};
use crate::tensor::{copy_region, Device, Tensor};
use crate::transfer::TransferBuffer;

/// Stored shards held by this rank, keyed by storage index.
pub type SourceTensors = BTreeMap<LocalTensorIndex, Tensor>;

/// Destination buffers of this rank, keyed by `(tensor name, global offset)`.
pub type Destinations<'a> = BTreeMap<(String, Vec<u64>), &'a mut Tensor>;

/// Counters for one executed epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochReport {
    /// Read items in the global plan.
    pub read_items: usize,
    pub local_copies: usize,
    pub batches: usize,
    pub broadcasts: usize,
    pub packed_broadcasts: usize,
    pub released_sources: usize,
}

/// Descriptors of every shard in `state_dict`, named as the checkpoint names them.
pub fn target_descriptors(
    state_dict: &ShardedStateDict,
    renames: &BTreeMap<String, String>,
) -> Vec<ShardDescriptor> {
    state_dict
        .values()
        .map(|shard| {
            let mut desc = shard.desc.clone();
            if let Some(name) = renames.get(&desc.key) {
                desc.key = name.clone();
            }
            desc
        })
        .collect()
}

/// Mutable views of every shard buffer in `state_dict`, keyed like [`target_descriptors`].
pub fn destination_map<'a>(
    state_dict: &'a mut ShardedStateDict,
    renames: &BTreeMap<String, String>,
) -> Destinations<'a> {
    state_dict
        .values_mut()
        .map(|shard| {
            let name = renames
                .get(&shard.desc.key)
                .cloned()
                .unwrap_or_else(|| shard.desc.key.clone());
            ((name, shard.desc.global_offset.clone()), &mut shard.tensor)
        })
        .collect()
}

/// Moves planned bytes between ranks.
///
/// Every rank runs the same schedule. With no worker groups each broadcast
/// runs on the whole world; otherwise items run on the group the scheduler
/// picked and ranks outside it skip them.
pub struct Executor<'a> {
    comm: &'a dyn Collective,
    config: &'a LoadConfig,
    groups: &'a [CommGroup],
}

struct EpochState<'s, 'd, 't> {
    sources: &'s mut SourceTensors,
    destinations: &'d mut Destinations<'t>,
    tracker: ReleaseTracker<LocalTensorIndex, usize>,
    buffer: TransferBuffer,
    report: EpochReport,
}

impl EpochState<'_, '_, '_> {
    fn finish(&mut self, ordinal: usize) {
        for index in self.tracker.complete(&ordinal) {
            self.sources.remove(&index);
            self.report.released_sources += 1;
        }
    }
}

pub(crate) fn lookup_source<'s>(sources: &'s SourceTensors, item: &ReadItem) -> Result<&'s Tensor> {
    sources.get(&source_index(item)).ok_or_else(|| {
        ReshardError::checkpoint(format!(
            "source shard of '{}' at {:?} is not loaded on rank {}",
            item.tensor_name, item.src_global_offset, item.src_rank
        ))
    })
}

fn lookup_destination<'d>(
    destinations: &'d mut Destinations<'_>,
    item: &ReadItem,
) -> Result<&'d mut Tensor> {
    let key = (item.tensor_name.clone(), item.dst_global_offset.clone());
    destinations
        .get_mut(&key)
        .map(|tensor| &mut **tensor)
        .ok_or_else(|| {
            ReshardError::tensor(format!(
                "no destination shard of '{}' at {:?}",
                item.tensor_name, item.dst_global_offset
            ))
        })
}

impl<'a> Executor<'a> {
    pub fn new(comm: &'a dyn Collective, config: &'a LoadConfig, groups: &'a [CommGroup]) -> Self {
        Self {
            comm,
            config,
            groups,
        }
    }

    /// Plans read items for `targets` and executes them.
    ///
    /// # Arguments
    /// * `index` - Stored shards to read from
    /// * `load_infos` - Which rank holds each stored shard
    /// * `targets` - This rank's destination shards
    /// * `sources` - Stored shards loaded on this rank; consumed as items run
    /// * `destinations` - Buffers for `targets`
    pub fn run_epoch(
        &self,
        index: &MetadataIndex,
        load_infos: &LoadInfos,
        targets: &[ShardDescriptor],
        sources: &mut SourceTensors,
        destinations: &mut Destinations<'_>,
    ) -> Result<EpochReport> {
        let items = get_read_items(self.comm, None, index, targets, load_infos)?;
        self.execute(EpochSchedule::new(items), sources, destinations)
    }

    /// Splits, batches and runs a planned schedule.
    pub fn execute(
        &self,
        mut schedule: EpochSchedule,
        sources: &mut SourceTensors,
        destinations: &mut Destinations<'_>,
    ) -> Result<EpochReport> {
        let rank = self.comm.rank();
        schedule.split()?;
        if self.groups.is_empty() {
            schedule.batch_single_group()?;
        } else {
            schedule.batch_multi_group(self.groups)?;
        }

        let local = schedule.local_items();
        let comm_items: Vec<&ReadItem> = schedule
            .batches()
            .iter()
            .flat_map(|b| b.items.iter())
            .collect();

        let mut tracker = ReleaseTracker::new();
        for (ordinal, item) in local.iter().chain(comm_items.iter().copied()).enumerate() {
            if item.src_rank == rank {
                tracker.track(source_index(item), ordinal);
            }
        }
        let largest = comm_items.iter().map(|i| i.numel()).max().unwrap_or(0);

        let mut state = EpochState {
            sources,
            destinations,
            tracker,
            buffer: TransferBuffer::sized_for(
                self.config.packed_dtype,
                largest,
                self.config.transfer_buffer_floor,
            ),
            report: EpochReport {
                read_items: local.len() + comm_items.len(),
                batches: schedule.batches().len(),
                ..EpochReport::default()
            },
        };

        for (ordinal, item) in local.iter().enumerate() {
            if item.src_rank == rank {
                let src = lookup_source(state.sources, item)?;
                let dst = lookup_destination(state.destinations, item)?;
                copy_local(src, item, dst)?;
                state.report.local_copies += 1;
            }
            state.finish(ordinal);
        }

        let mut ordinal = local.len();
        for batch in schedule.batches() {
            debug!(batch = %batch.label, items = batch.items.len(), "executing batch");
            let items = &batch.items;
            let mut i = 0;
            while i < items.len() {
                if self.packable(&items[i]) {
                    let end = self.run_length(items, i);
                    self.broadcast_packed(&items[i..end], ordinal + i, &mut state)?;
                    i = end;
                } else {
                    self.broadcast_item(&items[i], &mut state)?;
                    state.finish(ordinal + i);
                    i += 1;
                }
            }
            ordinal += items.len();
            self.comm.barrier(None)?;
        }

        schedule.mark_executed()?;
        info!(
            rank,
            items = state.report.read_items,
            local = state.report.local_copies,
            batches = state.report.batches,
            broadcasts = state.report.broadcasts,
            packed = state.report.packed_broadcasts,
            "epoch executed"
        );
        Ok(state.report)
    }

    fn packable(&self, item: &ReadItem) -> bool {
        self.config.pack_transfers && item.dtype == self.config.packed_dtype
    }

    /// End of the run of packable items starting at `start` that share its
    /// source and group.
    fn run_length(&self, items: &[ReadItem], start: usize) -> usize {
        let first = &items[start];
        let mut end = start + 1;
        while end < items.len()
            && self.packable(&items[end])
            && items[end].src_rank == first.src_rank
            && items[end].comm_group == first.comm_group
        {
            end += 1;
        }
        end
    }

    fn participates(&self, item: &ReadItem) -> bool {
        item.comm_group
            .as_ref()
            .map_or(true, |group| group.contains(self.comm.rank()))
    }

    fn broadcast_item(&self, item: &ReadItem, state: &mut EpochState<'_, '_, '_>) -> Result<()> {
        if !self.participates(item) {
            return Ok(());
        }
        let rank = self.comm.rank();
        let mut bytes = if rank == item.src_rank {
            lookup_source(state.sources, item)?
                .slice(&item.src_local_offset, &item.slice_shape)?
                .into_bytes()
        } else {
            vec![0u8; item.nbytes()]
        };
        self.comm
            .broadcast(&mut bytes, item.src_rank, item.comm_group.as_ref())?;
        state.report.broadcasts += 1;

        if item.dst_rank.contains(&rank) {
            let received = Tensor::new(item.dtype, item.slice_shape.clone(), bytes)?;
            lookup_destination(state.destinations, item)?
                .assign(&item.dst_local_offset, &received)?;
        }
        Ok(())
    }

    /// Broadcasts `run` through the transfer buffer, as many items per
    /// broadcast as fit.
    fn broadcast_packed(
        &self,
        run: &[ReadItem],
        first_ordinal: usize,
        state: &mut EpochState<'_, '_, '_>,
    ) -> Result<()> {
        let Some(head) = run.first() else {
            return Ok(());
        };
        if !self.participates(head) {
            return Ok(());
        }
        let rank = self.comm.rank();

        let mut start = 0;
        while start < run.len() {
            state.buffer.clear();
            let mut end = start;
            while end < run.len() {
                let item = &run[end];
                let fits = if rank == item.src_rank {
                    let slice = lookup_source(state.sources, item)?
                        .slice(&item.src_local_offset, &item.slice_shape)?;
                    state.buffer.append(&slice)?
                } else {
                    state.buffer.append_placeholder(&item.slice_shape)
                };
                if !fits {
                    break;
                }
                end += 1;
            }

            if end == start {
                self.broadcast_item(&run[start], state)?;
                state.finish(first_ordinal + start);
                start += 1;
                continue;
            }

            self.comm.broadcast(
                state.buffer.as_bytes_mut(),
                head.src_rank,
                head.comm_group.as_ref(),
            )?;
            state.report.packed_broadcasts += 1;

            let pieces = state.buffer.recover()?;
            for (offset, (item, piece)) in run[start..end].iter().zip(pieces).enumerate() {
                if item.dst_rank.contains(&rank) {
                    lookup_destination(state.destinations, item)?
                        .assign(&item.dst_local_offset, &piece)?;
                }
                state.finish(first_ordinal + start + offset);
            }
            start = end;
        }
        Ok(())
    }
}

/// Copies an item's region on one rank; buffers on different devices go
/// through a host copy.
pub fn copy_local(src: &Tensor, item: &ReadItem, dst: &mut Tensor) -> Result<()> {
    if src.device() == dst.device() {
        return copy_region(
            src,
            &item.src_local_offset,
            dst,
            &item.dst_local_offset,
            &item.slice_shape,
        );
    }
    let staged = src
        .slice(&item.src_local_offset, &item.slice_shape)?
        .with_device(Device::Host);
    dst.assign(&item.dst_local_offset, &staged)
}

fn source_index(item: &ReadItem) -> LocalTensorIndex {
    LocalTensorIndex::new(item.tensor_name.clone(), item.src_global_offset.clone())
}
