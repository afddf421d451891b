// rust/reshard-core/src/comm/collective.rs

//! Collective communication interface consumed by the engine.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ReshardError, Result};

/// A named, immutable set of ranks that take part in a collective together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommGroup {
    name: String,
    ranks: Vec<u32>,
}

impl CommGroup {
    /// Ranks are stored sorted and de-duplicated.
    pub fn new(name: impl Into<String>, ranks: impl IntoIterator<Item = u32>) -> Self {
        let mut ranks: Vec<u32> = ranks.into_iter().collect();
        ranks.sort_unstable();
        ranks.dedup();
        Self {
            name: name.into(),
            ranks,
        }
    }

    /// The group of every rank in a world of `world_size`.
    pub fn world(world_size: u32) -> Self {
        Self::new("world", 0..world_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ranks(&self) -> &[u32] {
        &self.ranks
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn contains(&self, rank: u32) -> bool {
        self.ranks.binary_search(&rank).is_ok()
    }

    pub fn contains_all(&self, ranks: &[u32]) -> bool {
        ranks.iter().all(|r| self.contains(*r))
    }
}

/// Blocking collectives over byte buffers.
///
/// `group: None` means the whole world. Every member of a group must issue
/// the same sequence of collectives on it.
pub trait Collective: Send + Sync {
    fn rank(&self) -> u32;

    fn world_size(&self) -> u32;

    /// Copies `buffer` from `src` into `buffer` on every other member.
    ///
    /// # Errors
    ///
    /// Returns an error if the caller or `src` is not in the group, or if the
    /// buffer lengths disagree.
    fn broadcast(&self, buffer: &mut [u8], src: u32, group: Option<&CommGroup>) -> Result<()>;

    /// Returns every member's payload, ordered by rank.
    fn all_gather_bytes(&self, payload: Vec<u8>, group: Option<&CommGroup>) -> Result<Vec<Vec<u8>>>;

    fn barrier(&self, group: Option<&CommGroup>) -> Result<()>;
}

/// All-gathers a serialisable value, returning one value per member in rank order.
pub fn all_gather_object<T>(
    comm: &dyn Collective,
    value: &T,
    group: Option<&CommGroup>,
) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
{
    let payload = bincode::serialize(value)
        .map_err(|e| ReshardError::serialization(format!("failed to encode gather payload: {e}")))?;
    comm.all_gather_bytes(payload, group)?
        .iter()
        .map(|bytes| {
            bincode::deserialize(bytes).map_err(|e| {
                ReshardError::serialization(format!("failed to decode gather payload: {e}"))
            })
        })
        .collect()
}

/// Collective for a single process: every operation is local.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloCollective;

impl Collective for SoloCollective {
    fn rank(&self) -> u32 {
        0
    }

    fn world_size(&self) -> u32 {
        1
    }

    fn broadcast(&self, _buffer: &mut [u8], src: u32, _group: Option<&CommGroup>) -> Result<()> {
        if src != 0 {
            return Err(ReshardError::communication(
                0,
                format!("broadcast from rank {src} in a world of one"),
            ));
        }
        Ok(())
    }

    fn all_gather_bytes(&self, payload: Vec<u8>, _group: Option<&CommGroup>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![payload])
    }

    fn barrier(&self, _group: Option<&CommGroup>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_normalises_ranks() {
        let group = CommGroup::new("tp", [3, 1, 3, 2]);
        assert_eq!(group.ranks(), &[1, 2, 3]);
        assert!(group.contains(2));
        assert!(!group.contains(0));
        assert!(group.contains_all(&[1, 3]));
        assert!(!group.contains_all(&[0, 1]));
    }

    #[test]
    fn test_solo_gather_object() {
        let comm = SoloCollective;
        let gathered = all_gather_object(&comm, &vec!["a".to_string()], None).unwrap();
        assert_eq!(gathered, vec![vec!["a".to_string()]]);
    }

    #[test]
    fn test_solo_broadcast_rejects_foreign_source() {
        let comm = SoloCollective;
        let mut buf = [1u8, 2];
        assert!(comm.broadcast(&mut buf, 0, None).is_ok());
        assert!(comm.broadcast(&mut buf, 1, None).is_err());
    }
}
