//! Runtime event stream payloads.

use crate::types::{CategoryId, CompetitorId, OpSeq, SiNumber};

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultEvent {
    /// A competitor was registered.
    CompetitorCreated {
        /// New competitor id.
        id: CompetitorId,
    },
    /// A card readout was bound to a competitor.
    ReadoutAssigned {
        /// Card that was read.
        si_number: SiNumber,
        /// Competitor now owning the punches.
        competitor_id: CompetitorId,
    },
    /// Ranked rows of a category changed.
    ResultsChanged {
        /// Recomputed category.
        category_id: CategoryId,
    },
    /// Persistence has reached at least this op sequence.
    DurableUpTo {
        /// Highest sequence known durable.
        op_seq: OpSeq,
    },
}
