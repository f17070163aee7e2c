//! Event, category, control-point and competitor records.

use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{
    CategoryId, CompetitorId, EventId, RaceStatus, RaceTime, ScoringMode, SiNumber, StationCode,
};

/// A race event; owns its categories and competitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Stable event identifier.
    pub id: EventId,
    /// Display name.
    pub name: String,
    /// Race clock epoch as Unix seconds.
    pub zero_time_unix: i64,
}

/// One control point of a category's course.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlPointSpec {
    /// Position on the course.
    pub order: u32,
    /// Station code punched at this point.
    pub code: StationCode,
    /// May be visited in any order within its segment.
    pub beacon: bool,
    /// Closes the current segment.
    pub separator: bool,
}

impl ControlPointSpec {
    /// Ordered, non-beacon control point.
    pub fn control(order: u32, code: StationCode) -> Self {
        Self {
            order,
            code,
            beacon: false,
            separator: false,
        }
    }

    /// Beacon control point.
    pub fn beacon(order: u32, code: StationCode) -> Self {
        Self {
            beacon: true,
            ..Self::control(order, code)
        }
    }

    /// Segment-closing control point.
    pub fn separator(order: u32, code: StationCode) -> Self {
        Self {
            separator: true,
            ..Self::control(order, code)
        }
    }
}

/// Competition category with its course.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Category {
    /// Stable category identifier.
    pub id: CategoryId,
    /// Owning event.
    pub event_id: EventId,
    /// Display name.
    pub name: String,
    /// Control points, ordered by [`ControlPointSpec::order`].
    pub control_points: Vec<ControlPointSpec>,
    /// Optional time limit in seconds.
    pub time_limit: Option<RaceTime>,
    /// Scoring mode.
    pub scoring: ScoringMode,
}

/// A registered competitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competitor {
    /// Stable competitor identifier.
    pub id: CompetitorId,
    /// Owning event.
    pub event_id: EventId,
    /// Category the competitor runs in.
    pub category_id: CategoryId,
    /// Display name.
    pub name: String,
    /// SI card number, unique within the event.
    pub si_number: Option<SiNumber>,
    /// Drawn start time, used when the card has no start record.
    pub start_time: Option<RaceTime>,
    /// Organizer-supplied status that overrides the computed one.
    pub manual_status: Option<RaceStatus>,
}

/// Insert payload used to create a new [`Competitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompetitorDraft {
    /// Owning event.
    pub event_id: EventId,
    /// Category the competitor runs in.
    pub category_id: CategoryId,
    /// Display name.
    pub name: String,
    /// SI card number.
    pub si_number: Option<SiNumber>,
    /// Drawn start time.
    pub start_time: Option<RaceTime>,
}

/// Sparse patch where each `Some` field overwrites the competitor value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompetitorPatch {
    /// Optional replacement for the category.
    pub category_id: Option<CategoryId>,
    /// Optional replacement for the name.
    pub name: Option<String>,
    /// Optional replacement for the SI card; `Some(None)` clears it.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub si_number: Option<Option<SiNumber>>,
    /// Optional replacement for the drawn start time.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub start_time: Option<Option<RaceTime>>,
}

// A present field (even `null`) is a set field.
fn present<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

impl CompetitorPatch {
    /// Returns true when no fields are set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Captures an inverse patch for all fields present in `self`.
    pub fn capture_inverse_for(&self, rec: &Competitor) -> Self {
        Self {
            category_id: self.category_id.map(|_| rec.category_id),
            name: self.name.as_ref().map(|_| rec.name.clone()),
            si_number: self.si_number.map(|_| rec.si_number),
            start_time: self.start_time.map(|_| rec.start_time),
        }
    }

    /// Applies this patch in place to `rec`.
    pub fn apply_to(&self, rec: &mut Competitor) {
        if let Some(v) = self.category_id {
            rec.category_id = v;
        }
        if let Some(v) = &self.name {
            rec.name = v.clone();
        }
        if let Some(v) = self.si_number {
            rec.si_number = v;
        }
        if let Some(v) = self.start_time {
            rec.start_time = v;
        }
    }
}
