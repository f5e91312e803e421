//! # First-Entry Detection
//!
//! Reduces a window of `lead_status_changed` events to the moment each lead
//! first moved into a watched status set from outside it.
//!
//! ```text
//!   t=10  A(out) → T1(in)     ← entry, kept
//!   t=20  T1(in) → T2(in)     ← intra-set hop, ignored
//!   t=30  T2(in) → B(out)
//!   t=40  B(out) → T1(in)     ← later entry, earlier one wins
//! ```

use std::collections::{BTreeMap, HashSet};

use crate::types::{EntityId, PipelineId, StatusChangeEvent, StatusId};

/// Earliest entry of a lead into the watched set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstEntry {
    /// Unix seconds of the transition.
    pub at: i64,
    pub status: StatusId,
    pub pipeline: PipelineId,
}

/// Returns the earliest outside→inside transition per entity.
///
/// Events with no "after" status are ignored. A missing "before" status
/// counts as outside the set.
pub fn first_entries(
    events: &[StatusChangeEvent],
    targets: &HashSet<StatusId>,
) -> BTreeMap<EntityId, FirstEntry> {
    let mut out: BTreeMap<EntityId, FirstEntry> = BTreeMap::new();

    for event in events {
        let Some(after) = event.to_status() else {
            continue;
        };
        if !targets.contains(&after.id) {
            continue;
        }
        let from_inside = event
            .from_status()
            .map(|before| targets.contains(&before.id))
            .unwrap_or(false);
        if from_inside {
            continue;
        }

        let candidate = FirstEntry {
            at: event.created_at,
            status: after.id,
            pipeline: after.pipeline_id,
        };
        out.entry(event.entity_id)
            .and_modify(|existing| {
                if candidate.at < existing.at {
                    *existing = candidate;
                }
            })
            .or_insert(candidate);
    }

    out
}
