// rust/reshard-core/src/plan/balancer.rs

//! Assignment of checkpoint files to the ranks that read them.
//!
//! Every needed file is read by exactly one rank that can see it. The
//! strategies are deterministic so every rank computes the same answer
//! locally from the gathered inputs.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::FileAssignment;
use crate::error::{PlanningError, Result};

/// Files per rank, in read order.
pub type RankFiles = BTreeMap<u32, Vec<String>>;

/// Trait for file assignment strategies.
pub trait FileAssigner: Send + Sync {
    /// Decides which rank reads which file.
    ///
    /// # Arguments
    /// * `needed` - Files each rank needs data from
    /// * `visible` - Files each rank can open locally
    ///
    /// # Returns
    /// Files to read per rank. Every rank present in either input has an
    /// entry, possibly empty.
    fn assign(&self, needed: &RankFiles, visible: &RankFiles) -> Result<RankFiles>;

    fn strategy(&self) -> FileAssignment;
}

/// Exclusive files first, then least-loaded greedy, then the cross-node remainder.
#[derive(Debug, Default)]
pub struct BalancedAssigner;

impl FileAssigner for BalancedAssigner {
    fn assign(&self, needed: &RankFiles, visible: &RankFiles) -> Result<RankFiles> {
        let mut local_needed = RankFiles::new();
        let mut cross_node = Vec::new();

        for (&rank, files) in needed {
            let seen: BTreeSet<&str> = visible
                .get(&rank)
                .map(|v| v.iter().map(String::as_str).collect())
                .unwrap_or_default();
            let (local, remote): (Vec<String>, Vec<String>) =
                files.iter().cloned().partition(|f| seen.contains(f.as_str()));
            cross_node.extend(remote);
            if !local.is_empty() {
                local_needed.insert(rank, local);
            }
        }

        let mut assignment = balance_read_files(&local_needed);
        for &rank in needed.keys().chain(visible.keys()) {
            assignment.entry(rank).or_default();
        }

        let loaded: BTreeSet<String> = assignment.values().flatten().cloned().collect();
        let mut pending = BTreeSet::new();
        let unloaded: Vec<String> = cross_node
            .into_iter()
            .filter(|f| !loaded.contains(f) && pending.insert(f.clone()))
            .collect();

        let readers = file_to_ranks(visible);
        for file in unloaded {
            let candidates = readers
                .get(file.as_str())
                .ok_or_else(|| PlanningError::UnreachableFile { file: file.clone() })?;
            let rank = least_loaded(&assignment, candidates);
            debug!(file = %file, rank, "assigned cross-node file");
            assignment.entry(rank).or_default().push(file);
        }

        Ok(assignment)
    }

    fn strategy(&self) -> FileAssignment {
        FileAssignment::Balanced
    }
}

/// Rarest files first, each to the least-loaded rank that can see it.
///
/// Suits checkpoints whose files are not tied to the rank that wrote them.
#[derive(Debug, Default)]
pub struct VisibilityAssigner;

impl FileAssigner for VisibilityAssigner {
    fn assign(&self, needed: &RankFiles, visible: &RankFiles) -> Result<RankFiles> {
        let readers = file_to_ranks(visible);
        let wanted: BTreeSet<&str> = needed.values().flatten().map(String::as_str).collect();

        let mut ordered = Vec::with_capacity(wanted.len());
        for file in wanted {
            let candidates = readers.get(file).ok_or_else(|| PlanningError::UnreachableFile {
                file: file.to_string(),
            })?;
            ordered.push((candidates.len(), file, candidates));
        }
        ordered.sort();

        let mut assignment = RankFiles::new();
        for &rank in needed.keys().chain(visible.keys()) {
            assignment.entry(rank).or_default();
        }
        for (_, file, candidates) in ordered {
            let rank = least_loaded(&assignment, candidates);
            assignment.entry(rank).or_default().push(file.to_string());
        }
        Ok(assignment)
    }

    fn strategy(&self) -> FileAssignment {
        FileAssignment::Visibility
    }
}

/// Create a file assigner based on the strategy.
pub fn create_assigner(strategy: FileAssignment) -> Box<dyn FileAssigner> {
    match strategy {
        FileAssignment::Balanced => Box::new(BalancedAssigner),
        FileAssignment::Visibility => Box::new(VisibilityAssigner),
    }
}

/// Splits files among the ranks listing them so each is read once.
///
/// A file listed by a single rank goes to that rank. The rest are handed
/// out one at a time: among the ranks with the fewest files so far, the one
/// with the fewest unread files takes its first unread file, which is then
/// struck from every other rank's list. Ties go to the lowest rank.
pub fn balance_read_files(rank_to_files: &RankFiles) -> RankFiles {
    let owners = file_to_ranks(rank_to_files);

    let mut not_read: RankFiles = rank_to_files
        .iter()
        .filter(|(_, files)| !files.is_empty())
        .map(|(rank, files)| (*rank, files.clone()))
        .collect();
    let mut read: RankFiles = rank_to_files.keys().map(|r| (*r, Vec::new())).collect();

    for (file, ranks) in &owners {
        if let [rank] = ranks.as_slice() {
            read.entry(*rank).or_default().push(file.to_string());
            strike(&mut not_read, file);
        }
    }

    while !not_read.is_empty() {
        let fewest = read.values().map(Vec::len).min().unwrap_or(0);
        let least: BTreeSet<u32> = read
            .iter()
            .filter(|(_, files)| files.len() == fewest)
            .map(|(rank, _)| *rank)
            .collect();

        let mut candidates: Vec<(usize, u32)> = not_read
            .iter()
            .filter(|(rank, _)| least.contains(*rank))
            .map(|(rank, files)| (files.len(), *rank))
            .collect();
        if candidates.is_empty() {
            candidates = not_read
                .iter()
                .map(|(rank, files)| (files.len(), *rank))
                .collect();
        }
        let Some(&(_, rank)) = candidates.iter().min() else {
            break;
        };
        let Some(file) = not_read.get(&rank).and_then(|files| files.first()).cloned() else {
            break;
        };

        debug!(file = %file, rank, "assigned shared file");
        read.entry(rank).or_default().push(file.clone());
        strike(&mut not_read, &file);
    }

    read
}

fn strike(not_read: &mut RankFiles, file: &str) {
    for files in not_read.values_mut() {
        files.retain(|f| f != file);
    }
    not_read.retain(|_, files| !files.is_empty());
}

fn file_to_ranks(rank_to_files: &RankFiles) -> BTreeMap<&str, Vec<u32>> {
    let mut owners: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
    for (rank, files) in rank_to_files {
        for file in files {
            let ranks = owners.entry(file.as_str()).or_default();
            if !ranks.contains(rank) {
                ranks.push(*rank);
            }
        }
    }
    owners
}

fn least_loaded(assignment: &RankFiles, candidates: &[u32]) -> u32 {
    candidates
        .iter()
        .map(|r| (assignment.get(r).map_or(0, Vec::len), *r))
        .min()
        .map(|(_, r)| r)
        .unwrap_or_default()
}
