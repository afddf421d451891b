// rust/reshard-core/src/comm/local.rs

//! In-process collectives: one handle per rank, ranks run on threads.
//!
//! Every collective call on a group takes the next sequence number for that
//! group and meets the other members at the `(group, sequence)` slot. A slot
//! is dropped once every member has picked up its result.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex};

use super::collective::{CommGroup, Collective};
use crate::error::{ReshardError, Result};

type SlotKey = (String, u64);

#[derive(Default)]
struct Slot {
    deposits: BTreeMap<u32, Vec<u8>>,
    departed: usize,
}

struct MeshState {
    world_size: u32,
    slots: Mutex<HashMap<SlotKey, Slot>>,
    ready: Condvar,
}

enum Wait {
    All,
    From(u32),
}

/// Builds connected [`LocalCollective`] handles.
pub struct LocalMesh;

impl LocalMesh {
    /// Returns one handle per rank, indexed by rank.
    pub fn new(world_size: u32) -> Vec<LocalCollective> {
        let state = Arc::new(MeshState {
            world_size,
            slots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| LocalCollective {
                rank,
                state: Arc::clone(&state),
                sequences: Mutex::new(HashMap::new()),
            })
            .collect()
    }
}

/// One rank's endpoint of a [`LocalMesh`].
pub struct LocalCollective {
    rank: u32,
    state: Arc<MeshState>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl LocalCollective {
    fn poisoned(&self) -> ReshardError {
        ReshardError::communication(self.rank, "local mesh state poisoned")
    }

    fn members(&self, group: Option<&CommGroup>) -> Result<(String, Vec<u32>)> {
        let (name, ranks) = match group {
            Some(g) => (g.name().to_string(), g.ranks().to_vec()),
            None => ("world".to_string(), (0..self.state.world_size).collect()),
        };
        if !ranks.contains(&self.rank) {
            return Err(ReshardError::communication(
                self.rank,
                format!("rank is not a member of group '{name}'"),
            ));
        }
        Ok((name, ranks))
    }

    fn next_sequence(&self, name: &str) -> Result<u64> {
        let mut sequences = self.sequences.lock().map_err(|_| self.poisoned())?;
        let seq = sequences.entry(name.to_string()).or_insert(0);
        let current = *seq;
        *seq += 1;
        Ok(current)
    }

    fn exchange(
        &self,
        group: Option<&CommGroup>,
        contribution: Option<Vec<u8>>,
        wait: Wait,
    ) -> Result<BTreeMap<u32, Vec<u8>>> {
        let (name, members) = self.members(group)?;
        if let Wait::From(src) = wait {
            if !members.contains(&src) {
                return Err(ReshardError::communication(
                    self.rank,
                    format!("source rank {src} is not a member of group '{name}'"),
                ));
            }
        }
        let key = (name.clone(), self.next_sequence(&name)?);

        let mut slots = self.state.slots.lock().map_err(|_| self.poisoned())?;
        let slot = slots.entry(key.clone()).or_default();
        if let Some(bytes) = contribution {
            slot.deposits.insert(self.rank, bytes);
        }
        self.state.ready.notify_all();

        let is_ready = |slot: &Slot| match wait {
            Wait::All => slot.deposits.len() == members.len(),
            Wait::From(src) => slot.deposits.contains_key(&src),
        };
        let mut slots = self
            .state
            .ready
            .wait_while(slots, |slots| !slots.get(&key).is_some_and(is_ready))
            .map_err(|_| self.poisoned())?;

        let slot = slots.get_mut(&key).ok_or_else(|| {
            ReshardError::communication(self.rank, format!("collective slot {key:?} vanished"))
        })?;
        let result = match wait {
            Wait::All => slot.deposits.clone(),
            Wait::From(src) => slot
                .deposits
                .get(&src)
                .map(|bytes| BTreeMap::from([(src, bytes.clone())]))
                .unwrap_or_default(),
        };
        slot.departed += 1;
        if slot.departed == members.len() {
            slots.remove(&key);
        }
        Ok(result)
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.state.world_size
    }

    fn broadcast(&self, buffer: &mut [u8], src: u32, group: Option<&CommGroup>) -> Result<()> {
        let contribution = (self.rank == src).then(|| buffer.to_vec());
        let received = self.exchange(group, contribution, Wait::From(src))?;
        let bytes = received.get(&src).ok_or_else(|| {
            ReshardError::communication(self.rank, format!("no payload from rank {src}"))
        })?;
        if bytes.len() != buffer.len() {
            return Err(ReshardError::communication(
                self.rank,
                format!(
                    "broadcast from rank {src} carried {} bytes, expected {}",
                    bytes.len(),
                    buffer.len()
                ),
            ));
        }
        buffer.copy_from_slice(bytes);
        Ok(())
    }

    fn all_gather_bytes(&self, payload: Vec<u8>, group: Option<&CommGroup>) -> Result<Vec<Vec<u8>>> {
        let gathered = self.exchange(group, Some(payload), Wait::All)?;
        Ok(gathered.into_values().collect())
    }

    fn barrier(&self, group: Option<&CommGroup>) -> Result<()> {
        self.exchange(group, Some(Vec::new()), Wait::All).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::all_gather_object;

    #[test]
    fn test_all_gather_orders_by_rank() {
        let handles = LocalMesh::new(3);
        let results: Vec<Vec<u32>> = std::thread::scope(|s| {
            let joins: Vec<_> = handles
                .iter()
                .map(|comm| s.spawn(move || all_gather_object(comm, &(comm.rank() * 10), None)))
                .collect();
            joins
                .into_iter()
                .map(|j| j.join().unwrap().unwrap())
                .collect()
        });

        for gathered in results {
            assert_eq!(gathered, vec![0, 10, 20]);
        }
    }

    #[test]
    fn test_broadcast_within_group() {
        let handles = LocalMesh::new(4);
        let group = CommGroup::new("pair", [1, 3]);

        let results: Vec<Option<Vec<u8>>> = std::thread::scope(|s| {
            let joins: Vec<_> = handles
                .iter()
                .map(|comm| {
                    let group = group.clone();
                    s.spawn(move || {
                        if !group.contains(comm.rank()) {
                            return None;
                        }
                        let mut buf = if comm.rank() == 3 { vec![7, 8, 9] } else { vec![0; 3] };
                        comm.broadcast(&mut buf, 3, Some(&group)).unwrap();
                        Some(buf)
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });

        assert_eq!(results[0], None);
        assert_eq!(results[1], Some(vec![7, 8, 9]));
        assert_eq!(results[3], Some(vec![7, 8, 9]));
    }

    #[test]
    fn test_repeated_collectives_stay_in_step() {
        let handles = LocalMesh::new(2);
        std::thread::scope(|s| {
            for comm in &handles {
                s.spawn(move || {
                    for round in 0u8..20 {
                        let mut buf = vec![if comm.rank() == 0 { round } else { 0 }];
                        comm.broadcast(&mut buf, 0, None).unwrap();
                        assert_eq!(buf, vec![round]);
                        comm.barrier(None).unwrap();
                    }
                });
            }
        });
    }

    #[test]
    fn test_non_member_is_rejected() {
        let handles = LocalMesh::new(2);
        let group = CommGroup::new("only-one", [1]);
        assert!(handles[0].barrier(Some(&group)).is_err());
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        let handles = LocalMesh::new(2);
        let errors: Vec<bool> = std::thread::scope(|s| {
            let joins: Vec<_> = handles
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let mut buf = if comm.rank() == 0 { vec![1u8; 4] } else { vec![0u8; 2] };
                        comm.broadcast(&mut buf, 0, None).is_err()
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });
        assert_eq!(errors, vec![false, true]);
    }
}
