//! Punch records and SI-card readout batches.

use serde::{Deserialize, Serialize};

use crate::types::{CompetitorId, EventId, PunchId, PunchKind, PunchStatus, RaceTime, SiNumber, StationCode};

/// One punch record bound to a competitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Punch {
    /// Stable punch identifier.
    pub id: PunchId,
    /// Owning event.
    pub event_id: EventId,
    /// Competitor the punch belongs to.
    pub competitor_id: CompetitorId,
    /// Station code; `None` for start/finish/clear records.
    pub code: Option<StationCode>,
    /// Record type.
    pub kind: PunchKind,
    /// Race-clock offset of the punch.
    pub time: RaceTime,
    /// Engine-assigned classification.
    pub status: PunchStatus,
}

impl Punch {
    /// Builds an unclassified punch; the store fills in `event_id`.
    pub fn new(
        id: PunchId,
        competitor_id: CompetitorId,
        kind: PunchKind,
        code: Option<StationCode>,
        time: RaceTime,
    ) -> Self {
        Self {
            id,
            event_id: 0,
            competitor_id,
            code,
            kind,
            time,
            status: PunchStatus::Valid,
        }
    }

    /// Start record at `time`.
    pub fn start(id: PunchId, competitor_id: CompetitorId, time: RaceTime) -> Self {
        Self::new(id, competitor_id, PunchKind::Start, None, time)
    }

    /// Control record for `code` at `time`.
    pub fn control(id: PunchId, competitor_id: CompetitorId, code: StationCode, time: RaceTime) -> Self {
        Self::new(id, competitor_id, PunchKind::Control, Some(code), time)
    }

    /// Finish record at `time`.
    pub fn finish(id: PunchId, competitor_id: CompetitorId, time: RaceTime) -> Self {
        Self::new(id, competitor_id, PunchKind::Finish, None, time)
    }
}

/// A punch as read from the card, before it is bound to a competitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawPunch {
    /// Station code; `None` for start/finish/clear records.
    pub code: Option<StationCode>,
    /// Record type.
    pub kind: PunchKind,
    /// Race-clock offset of the punch.
    pub time: RaceTime,
}

/// A full card dump keyed by SI number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadoutBatch {
    /// Event the card was read in.
    pub event_id: EventId,
    /// Card number.
    pub si_number: SiNumber,
    /// Punches in card order.
    pub punches: Vec<RawPunch>,
}
