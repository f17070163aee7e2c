//! Engine error taxonomy.

use thiserror::Error;

use crate::types::{CategoryId, CompetitorId, PunchId, SiNumber, StationCode};

/// Structural problems with a category's control-point list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CourseError {
    /// Category has no control points.
    #[error("category {0} has no control points")]
    Empty(CategoryId),

    /// Two points share an order index.
    #[error("duplicate order index {order} in category {category}")]
    DuplicateOrderIndex {
        /// Offending category.
        category: CategoryId,
        /// Repeated order index.
        order: u32,
    },

    /// Separator placed first or last.
    #[error("separator {code} cannot be the first or last control point")]
    SeparatorAtBoundary {
        /// Separator station code.
        code: StationCode,
    },

    /// A station code is used by two points of one course.
    #[error("station code {code} appears twice on the course")]
    DuplicateStationCode {
        /// Repeated station code.
        code: StationCode,
    },

    /// Separator flagged as a beacon.
    #[error("separator {code} cannot be a beacon")]
    SeparatorBeacon {
        /// Separator station code.
        code: StationCode,
    },
}

/// Failures surfaced by the reconciliation engine.
///
/// Bad race data is never an error; it resolves into a race status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Category cannot be turned into a course.
    #[error("invalid course definition: {0}")]
    InvalidCourseDefinition(#[from] CourseError),

    /// Punch record missing required fields; excluded from processing.
    #[error("malformed punch {punch_id}: {reason}")]
    MalformedPunch {
        /// Offending punch.
        punch_id: PunchId,
        /// What is missing.
        reason: String,
    },

    /// Readout matches zero or several competitors.
    #[error("SI card {si_number} matches {} active competitors", matches.len())]
    AmbiguousCardAssignment {
        /// Card number from the readout.
        si_number: SiNumber,
        /// Active competitors carrying that card.
        matches: Vec<CompetitorId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_display() {
        let err = EngineError::from(CourseError::Empty(4));
        assert_eq!(
            err.to_string(),
            "invalid course definition: category 4 has no control points"
        );

        let err = EngineError::MalformedPunch {
            punch_id: 9,
            reason: "control punch without station code".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "malformed punch 9: control punch without station code"
        );

        let err = EngineError::AmbiguousCardAssignment {
            si_number: 8_123_456,
            matches: vec![1, 2],
        };
        assert_eq!(err.to_string(), "SI card 8123456 matches 2 active competitors");
    }
}
