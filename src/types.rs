//! Shared primitive IDs and race-related enums.

use serde::{Deserialize, Serialize};

/// Event identifier.
pub type EventId = u64;
/// Category identifier.
pub type CategoryId = u64;
/// Competitor identifier.
pub type CompetitorId = u64;
/// Punch identifier.
pub type PunchId = u64;
/// Monotonic operation sequence number.
pub type OpSeq = u64;
/// SI card number.
pub type SiNumber = u32;
/// Control station code programmed into the SI station.
pub type StationCode = u32;
/// Race-clock offset in seconds relative to the event zero time.
pub type RaceTime = i64;

/// Kind of record read from an SI card.
///
/// The declaration order is the tie-break priority used when two records
/// carry the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PunchKind {
    /// Start station record.
    Start,
    /// Course control record.
    Control,
    /// Finish station record.
    Finish,
    /// Card clear record.
    Clear,
}

/// Per-punch classification assigned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PunchStatus {
    /// Accepted record.
    #[default]
    Valid,
    /// Record that does not satisfy the course.
    Invalid,
    /// Repeated record within the re-punch interval.
    Duplicate,
}

/// Race status of a competitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaceStatus {
    /// Run is OK.
    Valid,
    /// Finished, but the course was not completed in order.
    Disqualified,
    /// Started but never finished.
    DidNotFinish,
    /// Never started.
    DidNotStart,
    /// Finished a valid run beyond the category time limit.
    OverTime,
}

impl RaceStatus {
    /// Returns true for the status that takes part in ranking.
    pub fn is_ranked(self) -> bool {
        matches!(self, RaceStatus::Valid)
    }

    /// Short result-list label.
    pub fn label(self) -> &'static str {
        match self {
            RaceStatus::Valid => "OK",
            RaceStatus::Disqualified => "DSQ",
            RaceStatus::DidNotFinish => "DNF",
            RaceStatus::DidNotStart => "DNS",
            RaceStatus::OverTime => "OT",
        }
    }
}

/// How a category's runs are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ScoringMode {
    /// Fastest valid run wins.
    #[default]
    TimeBased,
    /// Most controls wins, time breaks ties.
    ScoreBased,
}
