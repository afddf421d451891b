// rust/reshard-core/src/schedule/scheduler.rs

//! Turns a flat list of read items into local copies and ordered
//! communication batches.

use std::collections::BTreeMap;

use tracing::debug;

use crate::comm::CommGroup;
use crate::error::{PlanningError, Result};
use crate::plan::{sort_items, MergeKey, ReadItem};
use crate::schedule::coloring::{dsatur, ConflictGraph};

/// Progress of one epoch's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Planned,
    Split,
    Batched,
    Executed,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Split => "split",
            Self::Batched => "batched",
            Self::Executed => "executed",
        }
    }
}

/// Items that run together, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Tensor name for single-group batches, `color {n}` otherwise.
    pub label: String,
    pub items: Vec<ReadItem>,
}

/// Stage machine for one load epoch.
///
/// Transitions must happen in order: [`split`](Self::split), then one of the
/// batching calls, then [`mark_executed`](Self::mark_executed).
#[derive(Debug)]
pub struct EpochSchedule {
    stage: Stage,
    planned: Vec<ReadItem>,
    local: Vec<ReadItem>,
    comm: Vec<ReadItem>,
    batches: Vec<Batch>,
}

impl EpochSchedule {
    pub fn new(items: Vec<ReadItem>) -> Self {
        Self {
            stage: Stage::Planned,
            planned: items,
            local: Vec::new(),
            comm: Vec::new(),
            batches: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Separates same-rank copies from items that need communication.
    ///
    /// # Errors
    /// Returns `UnsplitItem` if an item already has several destinations.
    pub fn split(&mut self) -> Result<()> {
        self.ensure_stage(Stage::Planned)?;
        let (local, comm) = split_read_items(std::mem::take(&mut self.planned))?;
        self.local = local;
        self.comm = comm;
        self.stage = Stage::Split;
        Ok(())
    }

    /// Batches communication items for execution on the world group.
    pub fn batch_single_group(&mut self) -> Result<()> {
        self.ensure_stage(Stage::Split)?;
        self.batches = schedule_single_group(std::mem::take(&mut self.comm));
        self.stage = Stage::Batched;
        Ok(())
    }

    /// Batches communication items across `groups` by conflict coloring.
    ///
    /// # Errors
    /// Returns `NoGroupFound` if no group holds every rank an item needs.
    pub fn batch_multi_group(&mut self, groups: &[CommGroup]) -> Result<()> {
        self.ensure_stage(Stage::Split)?;
        self.batches = schedule_multi_group(std::mem::take(&mut self.comm), groups)?;
        self.stage = Stage::Batched;
        Ok(())
    }

    pub fn mark_executed(&mut self) -> Result<()> {
        self.ensure_stage(Stage::Batched)?;
        self.stage = Stage::Executed;
        Ok(())
    }

    pub fn local_items(&self) -> &[ReadItem] {
        &self.local
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn comm_item_count(&self) -> usize {
        self.comm.len() + self.batches.iter().map(|b| b.items.len()).sum::<usize>()
    }

    fn ensure_stage(&self, stage: Stage) -> Result<()> {
        if self.stage != stage {
            return Err(PlanningError::InvalidStage {
                expected: stage.name(),
                found: self.stage.name(),
            }
            .into());
        }
        Ok(())
    }
}

/// Splits items into `(local, comm)`.
///
/// An item is local when its single destination is its source.
pub fn split_read_items(items: Vec<ReadItem>) -> Result<(Vec<ReadItem>, Vec<ReadItem>)> {
    let mut local = Vec::new();
    let mut comm = Vec::new();
    for item in items {
        if item.dst_rank.len() != 1 {
            return Err(PlanningError::UnsplitItem {
                tensor: item.tensor_name,
                count: item.dst_rank.len(),
            }
            .into());
        }
        if item.is_local() {
            local.push(item);
        } else {
            comm.push(item);
        }
    }
    Ok((local, comm))
}

/// One batch per tensor name, in name order.
///
/// Items that differ only in their destination are merged into one
/// broadcast with the union of destinations.
pub fn schedule_single_group(mut items: Vec<ReadItem>) -> Vec<Batch> {
    sort_items(&mut items);

    let mut by_name: BTreeMap<String, Vec<ReadItem>> = BTreeMap::new();
    for item in items {
        by_name.entry(item.tensor_name.clone()).or_default().push(item);
    }

    by_name
        .into_iter()
        .map(|(label, items)| {
            let items = merge_destinations(&items);
            debug!(tensor = %label, items = items.len(), "scheduled tensor batch");
            Batch { label, items }
        })
        .collect()
}

/// One batch per color of the group conflict graph, in color order.
pub fn schedule_multi_group(items: Vec<ReadItem>, groups: &[CommGroup]) -> Result<Vec<Batch>> {
    let candidates: Vec<&CommGroup> = groups.iter().filter(|g| g.len() > 1).collect();

    let mut assigned = Vec::with_capacity(items.len());
    for mut item in items {
        let need = item.need_ranks();
        let group = find_min_group(&need, &candidates).ok_or_else(|| {
            PlanningError::NoGroupFound {
                tensor: item.tensor_name.clone(),
                ranks: need.clone(),
            }
        })?;
        item.comm_group = Some(group.clone());
        assigned.push(item);
    }
    sort_items(&mut assigned);

    let coloring = dsatur(&ConflictGraph::from_groups(groups));
    let mut by_color: BTreeMap<usize, Vec<ReadItem>> = BTreeMap::new();
    for item in assigned {
        let color = item
            .comm_group
            .as_ref()
            .and_then(|g| coloring.get(g.name()))
            .copied()
            .unwrap_or_default();
        by_color.entry(color).or_default().push(item);
    }

    Ok(by_color
        .into_iter()
        .map(|(color, items)| {
            debug!(color, items = items.len(), "scheduled color batch");
            Batch {
                label: format!("color {color}"),
                items,
            }
        })
        .collect())
}

/// Smallest group holding every rank in `need`; the earliest wins ties.
pub fn find_min_group<'a>(need: &[u32], groups: &[&'a CommGroup]) -> Option<&'a CommGroup> {
    let mut best: Option<&'a CommGroup> = None;
    for group in groups {
        if group.contains_all(need) && best.map_or(true, |b| group.len() < b.len()) {
            best = Some(*group);
        }
    }
    best
}

fn merge_destinations(items: &[ReadItem]) -> Vec<ReadItem> {
    let mut slots: BTreeMap<MergeKey<'_>, usize> = BTreeMap::new();
    let mut merged: Vec<ReadItem> = Vec::new();

    for item in items {
        match slots.get(&item.merge_key()) {
            Some(&slot) => merged[slot].dst_rank.extend_from_slice(&item.dst_rank),
            None => {
                slots.insert(item.merge_key(), merged.len());
                merged.push(item.clone());
            }
        }
    }
    for item in &mut merged {
        item.dst_rank.sort_unstable();
        item.dst_rank.dedup();
    }
    sort_items(&mut merged);
    merged
}
