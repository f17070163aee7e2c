//! Mutation operation model and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    entity::{Category, Competitor, CompetitorPatch, Event},
    punch::Punch,
    types::{CategoryId, CompetitorId, EventId, OpSeq, RaceStatus},
};

/// Version number for serialized [`StoredOpEnvelope`] payloads.
pub const OP_FORMAT_VERSION: u16 = 1;

/// Immutable, fully materialized operation appended to the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Create or replace an event.
    UpsertEvent {
        /// Event record.
        event: Event,
    },
    /// Remove an event with everything under it.
    DeleteEvent {
        /// Removed event.
        id: EventId,
        /// Categories of the event at the time of the op.
        categories: Vec<CategoryId>,
    },
    /// Create or replace a category and its course.
    UpsertCategory {
        /// Category record.
        category: Category,
    },
    /// Remove a category with its competitors and punches.
    DeleteCategory {
        /// Removed category.
        id: CategoryId,
    },
    /// Insert a competitor.
    InsertCompetitor {
        /// Inserted record.
        competitor: Competitor,
    },
    /// Patch a competitor, including the inverse patch.
    PatchCompetitor {
        /// Competitor to mutate.
        id: CompetitorId,
        /// Category before the patch.
        category_id: CategoryId,
        /// Forward patch.
        patch: CompetitorPatch,
        /// Inverse patch that restores prior state.
        prev: CompetitorPatch,
    },
    /// Remove a competitor and its punches.
    DeleteCompetitor {
        /// Removed record.
        competitor: Competitor,
    },
    /// Replace a competitor's whole punch set.
    ReplacePunches {
        /// Owner of the punches.
        competitor_id: CompetitorId,
        /// Owner's category at the time of the op.
        category_id: CategoryId,
        /// New punch set.
        punches: Vec<Punch>,
    },
    /// Set or clear the organizer's status override.
    SetManualStatus {
        /// Competitor to mutate.
        competitor_id: CompetitorId,
        /// Owner's category at the time of the op.
        category_id: CategoryId,
        /// New override.
        status: Option<RaceStatus>,
    },
}

impl Op {
    /// Categories whose results this op can change.
    pub fn affected_categories(&self) -> Vec<CategoryId> {
        match self {
            Op::UpsertEvent { .. } => Vec::new(),
            Op::DeleteEvent { categories, .. } => categories.clone(),
            Op::UpsertCategory { category } => vec![category.id],
            Op::DeleteCategory { id } => vec![*id],
            Op::InsertCompetitor { competitor } | Op::DeleteCompetitor { competitor } => {
                vec![competitor.category_id]
            }
            Op::PatchCompetitor {
                category_id, patch, ..
            } => {
                let mut out = vec![*category_id];
                out.extend(patch.category_id.filter(|c| c != category_id));
                out
            }
            Op::ReplacePunches { category_id, .. } | Op::SetManualStatus { category_id, .. } => {
                vec![*category_id]
            }
        }
    }
}

/// Journal row metadata plus operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOp {
    /// Monotonic operation sequence.
    pub seq: OpSeq,
    /// Operation timestamp in milliseconds.
    pub ts_ms: u64,
    /// Operation body.
    pub op: Op,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOpEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped operation.
    pub stored: StoredOp,
}

impl StoredOpEnvelope {
    /// Constructs an envelope using [`OP_FORMAT_VERSION`].
    pub fn new(stored: StoredOp) -> Self {
        Self {
            format_version: OP_FORMAT_VERSION,
            stored,
        }
    }
}
