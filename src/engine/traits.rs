use crate::{
    entity::{Category, Competitor},
    punch::Punch,
    types::{CategoryId, CompetitorId, EventId, RaceStatus, SiNumber},
};

/// Read side of the storage collaborator.
///
/// Implementations hand the engine a consistent snapshot; the engine never
/// writes through this trait.
pub trait DataSource {
    /// Error raised for unknown ids.
    type Error;

    /// Category with its ordered control points.
    fn fetch_category(&self, id: CategoryId) -> Result<Category, Self::Error>;
    /// Competitors registered in a category.
    fn fetch_competitors(&self, category_id: CategoryId) -> Result<Vec<Competitor>, Self::Error>;
    /// Raw, unordered punches of a competitor.
    fn fetch_punches(&self, competitor_id: CompetitorId) -> Result<Vec<Punch>, Self::Error>;
    /// Organizer override of a competitor's status.
    fn fetch_manual_override(&self, competitor_id: CompetitorId) -> Result<Option<RaceStatus>, Self::Error>;
    /// Returns true when no competitor of the event carries `si_number`.
    fn check_si_card_unique(&self, si_number: SiNumber, event_id: EventId) -> bool;
}
