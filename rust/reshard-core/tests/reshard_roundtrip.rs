// rust/reshard-core/tests/reshard_roundtrip.rs

//! Save under one layout, load under another, reshard back and gather.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use reshard_core::comm::{Collective, LocalMesh};
use reshard_core::engine::{FullParamGather, ReshardOptions};
use reshard_core::shard::placement::shard_full_tensor;
use reshard_core::{
    reshard_sharded_state_dict, CheckpointLoader, CheckpointSaver, DType, Placement, ProcessMesh,
    ReshardConfig, ShardedStateDict, ShardedTensor, StorageConfig, Tensor, TensorKey,
};
use tempfile::TempDir;

const WORLD: u32 = 4;

fn arange(shape: Vec<u64>, start: f32) -> Tensor {
    let n: u64 = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|v| start + v as f32).collect();
    Tensor::from_f32(shape, &values).unwrap()
}

fn full_tensors() -> BTreeMap<&'static str, Tensor> {
    let mut tensors = BTreeMap::new();
    tensors.insert("layers.0.weight", arange(vec![8, 6], 0.0));
    tensors.insert("layers.0.bias", arange(vec![8], 1000.0));
    tensors.insert("step", Tensor::from_f32(vec![], &[42.0]).unwrap());
    tensors
}

/// Layout A: a 2x2 mesh, weights split by rows on the first mesh dim and by
/// columns on the second; bias replicated; step replicated.
fn layout_a(rank: u32) -> ShardedStateDict {
    let mesh = ProcessMesh::new(vec![2, 2], (0..WORLD).collect()).unwrap();
    let placements = |name: &str| match name {
        "layers.0.weight" => vec![Placement::Shard(0), Placement::Shard(1)],
        _ => vec![Placement::Replicate, Placement::Replicate],
    };
    build(rank, &mesh, placements)
}

/// Layout B: a linear mesh, weights and bias split by rows; step replicated.
fn layout_b(rank: u32) -> ShardedStateDict {
    let mesh = ProcessMesh::linear(WORLD);
    let placements = |name: &str| match name {
        "step" => vec![Placement::Replicate],
        _ => vec![Placement::Shard(0)],
    };
    build(rank, &mesh, placements)
}

fn build(
    rank: u32,
    mesh: &ProcessMesh,
    placements: impl Fn(&str) -> Vec<Placement>,
) -> ShardedStateDict {
    let mut sd = ShardedStateDict::new();
    for (name, full) in full_tensors() {
        if let Some(shard) = shard_full_tensor(name, &full, mesh, &placements(name), rank).unwrap() {
            sd.insert(TensorKey::from(name), shard);
        }
    }
    sd
}

fn zeroed(sd: &ShardedStateDict) -> ShardedStateDict {
    sd.iter()
        .map(|(key, shard)| {
            let tensor = Tensor::zeros(shard.desc.dtype, shard.desc.local_shape.clone());
            (key.clone(), ShardedTensor::new(shard.desc.clone(), tensor).unwrap())
        })
        .collect()
}

fn create_test_config(temp_dir: &TempDir) -> ReshardConfig {
    let mut config = ReshardConfig::default();
    config.storage = StorageConfig {
        base_path: temp_dir.path().to_path_buf(),
        ..StorageConfig::default()
    };
    config.load.packed_dtype = DType::F32;
    config.load.transfer_buffer_floor = 16;
    config
}

#[test]
fn test_save_load_reshard_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);

    std::thread::scope(|s| {
        let handles: Vec<_> = LocalMesh::new(WORLD)
            .into_iter()
            .map(|comm| {
                let config = &config;
                s.spawn(move || {
                    let rank = comm.rank();
                    let comm: Arc<dyn Collective> = Arc::new(comm);
                    let original = layout_a(rank);

                    let saver = CheckpointSaver::from_config(config.clone(), comm.clone()).unwrap();
                    let saved = saver
                        .save_state_dict(&original, Path::new("step_42"), 7)
                        .unwrap();
                    assert_eq!(saved.unique_id, 7);

                    let loader = CheckpointLoader::from_config(config.clone(), comm.clone()).unwrap();
                    let mut loaded = zeroed(&layout_b(rank));
                    let report = loader
                        .load_state_dict(&mut loaded, Path::new("step_42"), None)
                        .unwrap();
                    assert_eq!(report.unique_id, 7);
                    assert!(report.missing_keys.is_empty());
                    assert_eq!(loaded, layout_b(rank));

                    let mut back = zeroed(&original);
                    let options = ReshardOptions {
                        load: config.load.clone(),
                        groups: Vec::new(),
                    };
                    reshard_sharded_state_dict(comm.as_ref(), loaded, &mut back, &options).unwrap();
                    assert_eq!(back, original);

                    let gathered: BTreeMap<String, Tensor> =
                        FullParamGather::new(comm.as_ref(), &config.load, back)
                            .unwrap()
                            .collect::<reshard_core::Result<_>>()
                            .unwrap();
                    for (name, full) in full_tensors() {
                        assert_eq!(gathered[name], full, "tensor {name} on rank {rank}");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });
}

#[test]
fn test_merged_load_on_coordinator() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);

    let merged: Vec<BTreeMap<String, Tensor>> = std::thread::scope(|s| {
        let handles: Vec<_> = LocalMesh::new(WORLD)
            .into_iter()
            .map(|comm| {
                let config = &config;
                s.spawn(move || {
                    let rank = comm.rank();
                    let comm: Arc<dyn Collective> = Arc::new(comm);
                    CheckpointSaver::from_config(config.clone(), comm.clone())
                        .unwrap()
                        .save_state_dict(&layout_b(rank), Path::new("ckpt"), 0)
                        .unwrap();
                    CheckpointLoader::from_config(config.clone(), comm)
                        .unwrap()
                        .load_merged_state_dict(Path::new("ckpt"), Some("layers.0"), None)
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let full = full_tensors();
    assert_eq!(merged[0].len(), 2);
    assert_eq!(merged[0]["weight"], full["layers.0.weight"]);
    assert_eq!(merged[0]["bias"], full["layers.0.bias"]);
    assert!(merged[1..].iter().all(BTreeMap::is_empty));
}
