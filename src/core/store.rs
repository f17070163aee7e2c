use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    course::CourseDefinition,
    engine::{traits::DataSource, CompetitorPunches},
    entity::{Category, Competitor, CompetitorDraft, CompetitorPatch, Event},
    error::EngineError,
    op::{Op, StoredOp},
    punch::{Punch, ReadoutBatch},
    types::{CategoryId, CompetitorId, EventId, OpSeq, PunchId, PunchStatus, RaceStatus, SiNumber},
};

use super::indices::{link, unlink, IdIndex};

/// Rejected store mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No event with this id.
    #[error("unknown event {0}")]
    MissingEvent(EventId),
    /// No category with this id.
    #[error("unknown category {0}")]
    MissingCategory(CategoryId),
    /// No competitor with this id.
    #[error("unknown competitor {0}")]
    MissingCompetitor(CompetitorId),
    /// The card is already carried by another competitor of the event.
    #[error("SI card {si_number} already used in event {event_id}")]
    DuplicateSiNumber {
        /// Card number.
        si_number: SiNumber,
        /// Event the card is taken in.
        event_id: EventId,
    },
    /// A competitor and its category would belong to different events.
    #[error("category {category_id} belongs to event {expected}, not {found}")]
    EventMismatch {
        /// Category involved.
        category_id: CategoryId,
        /// Event of the category.
        expected: EventId,
        /// Event the competitor claims.
        found: EventId,
    },
    /// Engine-level rejection.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Full store image written at checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshotV1 {
    /// Sequence the next op will get.
    pub next_op_seq: OpSeq,
    /// Id the next competitor will get.
    pub next_competitor_id: CompetitorId,
    /// Id the next punch will get.
    pub next_punch_id: PunchId,
    /// Events by ascending id.
    pub events: Vec<Event>,
    /// Categories by ascending id.
    pub categories: Vec<Category>,
    /// Competitors by ascending id.
    pub competitors: Vec<Competitor>,
    /// Punches grouped by competitor.
    pub punches: Vec<Punch>,
}

/// Authoritative in-memory state of every event.
///
/// Each mutation is applied, then queued as a [`StoredOp`] until
/// [`EventStore::drain_pending_ops`] hands it to the journal.
#[derive(Debug, Default)]
pub struct EventStore {
    events: HashMap<EventId, Event>,
    categories: HashMap<CategoryId, Category>,
    competitors: HashMap<CompetitorId, Competitor>,
    punches: HashMap<CompetitorId, Vec<Punch>>,
    by_card: IdIndex<(EventId, SiNumber)>,
    by_category: IdIndex<CategoryId>,
    pending_ops: Vec<StoredOp>,
    next_op_seq: OpSeq,
    next_competitor_id: CompetitorId,
    next_punch_id: PunchId,
}

impl EventStore {
    /// Empty store; ids and sequences start at 1.
    pub fn new() -> Self {
        Self {
            next_op_seq: 1,
            next_competitor_id: 1,
            next_punch_id: 1,
            ..Self::default()
        }
    }

    /// Rebuilds a store from a checkpoint image.
    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> Result<Self, StoreError> {
        let mut store = Self {
            next_op_seq: snapshot.next_op_seq,
            next_competitor_id: snapshot.next_competitor_id,
            next_punch_id: snapshot.next_punch_id,
            ..Self::default()
        };

        for event in snapshot.events {
            store.events.insert(event.id, event);
        }
        for category in snapshot.categories {
            if !store.events.contains_key(&category.event_id) {
                return Err(StoreError::MissingEvent(category.event_id));
            }
            store.categories.insert(category.id, category);
        }
        for competitor in snapshot.competitors {
            if !store.categories.contains_key(&competitor.category_id) {
                return Err(StoreError::MissingCategory(competitor.category_id));
            }
            store.insert_indices(&competitor);
            store.competitors.insert(competitor.id, competitor);
        }
        for punch in snapshot.punches {
            if !store.competitors.contains_key(&punch.competitor_id) {
                return Err(StoreError::MissingCompetitor(punch.competitor_id));
            }
            store.punches.entry(punch.competitor_id).or_default().push(punch);
        }

        Ok(store)
    }

    /// Deterministic image of the whole store.
    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        let mut events: Vec<_> = self.events.values().cloned().collect();
        events.sort_by_key(|e| e.id);
        let mut categories: Vec<_> = self.categories.values().cloned().collect();
        categories.sort_by_key(|c| c.id);
        let mut competitors: Vec<_> = self.competitors.values().cloned().collect();
        competitors.sort_by_key(|c| c.id);
        let punches = competitors
            .iter()
            .flat_map(|c| self.punches.get(&c.id).into_iter().flatten().cloned())
            .collect();

        StoreSnapshotV1 {
            next_op_seq: self.next_op_seq,
            next_competitor_id: self.next_competitor_id,
            next_punch_id: self.next_punch_id,
            events,
            categories,
            competitors,
            punches,
        }
    }

    /// Creates or replaces an event.
    pub fn upsert_event(&mut self, event: Event) -> Result<StoredOp, StoreError> {
        self.commit(Op::UpsertEvent { event })
    }

    /// Removes an event with every category, competitor and punch under it.
    pub fn delete_event(&mut self, id: EventId) -> Result<StoredOp, StoreError> {
        if !self.events.contains_key(&id) {
            return Err(StoreError::MissingEvent(id));
        }
        let categories = self.categories_of_event(id).iter().map(|c| c.id).collect();
        self.commit(Op::DeleteEvent { id, categories })
    }

    /// Stores a category; the course must build before the op is committed.
    pub fn upsert_category(&mut self, category: Category) -> Result<StoredOp, StoreError> {
        CourseDefinition::build(&category).map_err(EngineError::from)?;
        self.commit(Op::UpsertCategory { category })
    }

    /// Removes a category with its competitors and their punches.
    pub fn delete_category(&mut self, id: CategoryId) -> Result<StoredOp, StoreError> {
        self.commit(Op::DeleteCategory { id })
    }

    /// Registers a competitor; the draft's event must own its category.
    pub fn insert_competitor(&mut self, draft: CompetitorDraft) -> Result<(CompetitorId, StoredOp), StoreError> {
        self.ensure_category_in_event(draft.category_id, draft.event_id)?;
        if let Some(si_number) = draft.si_number {
            self.ensure_card_free(si_number, draft.event_id, None)?;
        }

        let competitor = Competitor {
            id: self.next_competitor_id,
            event_id: draft.event_id,
            category_id: draft.category_id,
            name: draft.name,
            si_number: draft.si_number,
            start_time: draft.start_time,
            manual_status: None,
        };
        let id = competitor.id;
        let stored = self.commit(Op::InsertCompetitor { competitor })?;
        Ok((id, stored))
    }

    /// Applies a sparse patch; a category move must stay inside the event.
    pub fn patch_competitor(&mut self, id: CompetitorId, patch: CompetitorPatch) -> Result<StoredOp, StoreError> {
        let rec = self.competitors.get(&id).ok_or(StoreError::MissingCompetitor(id))?;
        if let Some(category_id) = patch.category_id {
            self.ensure_category_in_event(category_id, rec.event_id)?;
        }
        if let Some(Some(si_number)) = patch.si_number {
            self.ensure_card_free(si_number, rec.event_id, Some(id))?;
        }
        let prev = patch.capture_inverse_for(rec);
        let category_id = rec.category_id;
        self.commit(Op::PatchCompetitor {
            id,
            category_id,
            patch,
            prev,
        })
    }

    /// Removes a competitor and its punches.
    pub fn delete_competitor(&mut self, id: CompetitorId) -> Result<StoredOp, StoreError> {
        let competitor = self
            .competitors
            .get(&id)
            .cloned()
            .ok_or(StoreError::MissingCompetitor(id))?;
        self.commit(Op::DeleteCompetitor { competitor })
    }

    /// Replaces the punch set of `competitor_id`; ids and ownership are reassigned.
    pub fn replace_punches(&mut self, competitor_id: CompetitorId, punches: Vec<Punch>) -> Result<StoredOp, StoreError> {
        let rec = self
            .competitors
            .get(&competitor_id)
            .ok_or(StoreError::MissingCompetitor(competitor_id))?;
        let (event_id, category_id) = (rec.event_id, rec.category_id);

        let punches = punches
            .into_iter()
            .map(|p| {
                let id = self.next_punch_id;
                self.next_punch_id += 1;
                Punch {
                    id,
                    event_id,
                    competitor_id,
                    status: PunchStatus::Valid,
                    ..p
                }
            })
            .collect();

        self.commit(Op::ReplacePunches {
            competitor_id,
            category_id,
            punches,
        })
    }

    /// Sets or clears the organizer's status override.
    pub fn set_manual_status(
        &mut self,
        competitor_id: CompetitorId,
        status: Option<RaceStatus>,
    ) -> Result<StoredOp, StoreError> {
        let category_id = self
            .competitors
            .get(&competitor_id)
            .ok_or(StoreError::MissingCompetitor(competitor_id))?
            .category_id;
        self.commit(Op::SetManualStatus {
            competitor_id,
            category_id,
            status,
        })
    }

    /// Binds a card dump to the one competitor of the event carrying that card.
    pub fn assign_readout(&mut self, batch: ReadoutBatch) -> Result<(CompetitorId, StoredOp), StoreError> {
        let matches = self.competitors_with_card(batch.si_number, batch.event_id);
        if matches.len() != 1 {
            return Err(EngineError::AmbiguousCardAssignment {
                si_number: batch.si_number,
                matches,
            }
            .into());
        }
        let competitor_id = matches[0];

        let punches = batch
            .punches
            .into_iter()
            .map(|raw| Punch::new(0, competitor_id, raw.kind, raw.code, raw.time))
            .collect();
        let stored = self.replace_punches(competitor_id, punches)?;
        info!(si_number = batch.si_number, competitor_id, "readout assigned");
        Ok((competitor_id, stored))
    }

    /// Re-applies a journaled op without queueing it again.
    pub fn apply_replayed_op(&mut self, stored: StoredOp) -> Result<(), StoreError> {
        self.apply_op(&stored.op)?;
        self.bump_next_seq_from(stored.seq);
        Ok(())
    }

    /// True when no competitor of the event carries the card.
    pub fn check_si_card_unique(&self, si_number: SiNumber, event_id: EventId) -> bool {
        self.competitors_with_card(si_number, event_id).is_empty()
    }

    /// Competitors of the event registered with the card.
    pub fn competitors_with_card(&self, si_number: SiNumber, event_id: EventId) -> Vec<CompetitorId> {
        self.by_card
            .get(&(event_id, si_number))
            .cloned()
            .unwrap_or_default()
    }

    /// Looks up an event.
    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(&id)
    }

    /// Looks up a category.
    pub fn category(&self, id: CategoryId) -> Option<&Category> {
        self.categories.get(&id)
    }

    /// Looks up a competitor.
    pub fn competitor(&self, id: CompetitorId) -> Option<&Competitor> {
        self.competitors.get(&id)
    }

    /// Stored punches of a competitor, empty when none.
    pub fn punches(&self, competitor_id: CompetitorId) -> &[Punch] {
        self.punches.get(&competitor_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ids of every stored category, ascending.
    pub fn category_ids(&self) -> Vec<CategoryId> {
        let mut out: Vec<_> = self.categories.keys().copied().collect();
        out.sort_unstable();
        out
    }

    /// Categories of an event by ascending id.
    pub fn categories_of_event(&self, event_id: EventId) -> Vec<&Category> {
        let mut out: Vec<_> = self
            .categories
            .values()
            .filter(|c| c.event_id == event_id)
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }

    /// Competitors currently in a category.
    pub fn competitors_in_category(&self, category_id: CategoryId) -> Vec<&Competitor> {
        self.by_category
            .get(&category_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.competitors.get(id))
            .collect()
    }

    /// Competitors of a category paired with their punches, ready for the engine.
    pub fn category_entries(&self, category_id: CategoryId) -> Vec<CompetitorPunches> {
        self.competitors_in_category(category_id)
            .into_iter()
            .map(|c| CompetitorPunches {
                competitor: c.clone(),
                punches: self.punches(c.id).to_vec(),
            })
            .collect()
    }

    /// Hands over ops committed since the last drain.
    pub fn drain_pending_ops(&mut self) -> Vec<StoredOp> {
        std::mem::take(&mut self.pending_ops)
    }

    /// Sequence of the last committed op, 0 when empty.
    pub fn latest_op_seq(&self) -> OpSeq {
        self.next_op_seq.saturating_sub(1)
    }

    fn ensure_category_in_event(&self, category_id: CategoryId, event_id: EventId) -> Result<(), StoreError> {
        let category = self
            .categories
            .get(&category_id)
            .ok_or(StoreError::MissingCategory(category_id))?;
        if category.event_id != event_id {
            return Err(StoreError::EventMismatch {
                category_id,
                expected: category.event_id,
                found: event_id,
            });
        }
        Ok(())
    }

    fn ensure_card_free(
        &self,
        si_number: SiNumber,
        event_id: EventId,
        except: Option<CompetitorId>,
    ) -> Result<(), StoreError> {
        let taken = self
            .competitors_with_card(si_number, event_id)
            .into_iter()
            .any(|id| Some(id) != except);
        if taken {
            return Err(StoreError::DuplicateSiNumber { si_number, event_id });
        }
        Ok(())
    }

    fn commit(&mut self, op: Op) -> Result<StoredOp, StoreError> {
        self.apply_op(&op)?;
        let seq = self.next_op_seq;
        self.next_op_seq += 1;
        let stored = StoredOp {
            seq,
            ts_ms: now_ms(),
            op,
        };
        self.pending_ops.push(stored.clone());
        Ok(stored)
    }

    fn apply_op(&mut self, op: &Op) -> Result<(), StoreError> {
        match op {
            Op::UpsertEvent { event } => {
                self.events.insert(event.id, event.clone());
            }
            Op::DeleteEvent { id, .. } => {
                self.events.remove(id).ok_or(StoreError::MissingEvent(*id))?;
                let doomed: Vec<CategoryId> = self.categories_of_event(*id).iter().map(|c| c.id).collect();
                for category_id in doomed {
                    self.remove_category(category_id);
                }
            }
            Op::UpsertCategory { category } => {
                if !self.events.contains_key(&category.event_id) {
                    return Err(StoreError::MissingEvent(category.event_id));
                }
                if let Some(old) = self.categories.get(&category.id) {
                    let populated = self.by_category.get(&category.id).is_some_and(|ids| !ids.is_empty());
                    if old.event_id != category.event_id && populated {
                        return Err(StoreError::EventMismatch {
                            category_id: category.id,
                            expected: old.event_id,
                            found: category.event_id,
                        });
                    }
                }
                self.categories.insert(category.id, category.clone());
            }
            Op::DeleteCategory { id } => {
                if !self.categories.contains_key(id) {
                    return Err(StoreError::MissingCategory(*id));
                }
                self.remove_category(*id);
            }
            Op::InsertCompetitor { competitor } => {
                self.ensure_category_in_event(competitor.category_id, competitor.event_id)?;
                self.next_competitor_id = self.next_competitor_id.max(competitor.id.saturating_add(1));
                self.insert_indices(competitor);
                self.competitors.insert(competitor.id, competitor.clone());
            }
            Op::PatchCompetitor { id, patch, .. } => {
                let old = self.competitors.get(id).cloned().ok_or(StoreError::MissingCompetitor(*id))?;
                if let Some(category_id) = patch.category_id {
                    self.ensure_category_in_event(category_id, old.event_id)?;
                }
                let mut new = old.clone();
                patch.apply_to(&mut new);
                self.remove_indices(&old);
                self.insert_indices(&new);
                self.competitors.insert(*id, new);
            }
            Op::DeleteCompetitor { competitor } => {
                if !self.competitors.contains_key(&competitor.id) {
                    return Err(StoreError::MissingCompetitor(competitor.id));
                }
                self.remove_competitor(competitor.id);
            }
            Op::ReplacePunches {
                competitor_id,
                punches,
                ..
            } => {
                if !self.competitors.contains_key(competitor_id) {
                    return Err(StoreError::MissingCompetitor(*competitor_id));
                }
                if let Some(max) = punches.iter().map(|p| p.id).max() {
                    self.next_punch_id = self.next_punch_id.max(max.saturating_add(1));
                }
                self.punches.insert(*competitor_id, punches.clone());
            }
            Op::SetManualStatus {
                competitor_id,
                status,
                ..
            } => {
                let rec = self
                    .competitors
                    .get_mut(competitor_id)
                    .ok_or(StoreError::MissingCompetitor(*competitor_id))?;
                rec.manual_status = *status;
            }
        }
        Ok(())
    }

    fn remove_category(&mut self, id: CategoryId) {
        self.categories.remove(&id);
        for competitor_id in self.by_category.get(&id).cloned().unwrap_or_default() {
            self.remove_competitor(competitor_id);
        }
    }

    fn remove_competitor(&mut self, id: CompetitorId) {
        if let Some(old) = self.competitors.remove(&id) {
            self.remove_indices(&old);
        }
        self.punches.remove(&id);
    }

    fn insert_indices(&mut self, rec: &Competitor) {
        if let Some(si_number) = rec.si_number {
            link(&mut self.by_card, (rec.event_id, si_number), rec.id);
        }
        link(&mut self.by_category, rec.category_id, rec.id);
    }

    fn remove_indices(&mut self, rec: &Competitor) {
        if let Some(si_number) = rec.si_number {
            unlink(&mut self.by_card, &(rec.event_id, si_number), rec.id);
        }
        unlink(&mut self.by_category, &rec.category_id, rec.id);
    }

    fn bump_next_seq_from(&mut self, seq: OpSeq) {
        self.next_op_seq = self.next_op_seq.max(seq.saturating_add(1));
    }
}

impl DataSource for EventStore {
    type Error = StoreError;

    fn fetch_category(&self, id: CategoryId) -> Result<Category, StoreError> {
        self.category(id).cloned().ok_or(StoreError::MissingCategory(id))
    }

    fn fetch_competitors(&self, category_id: CategoryId) -> Result<Vec<Competitor>, StoreError> {
        if !self.categories.contains_key(&category_id) {
            return Err(StoreError::MissingCategory(category_id));
        }
        Ok(self
            .competitors_in_category(category_id)
            .into_iter()
            .cloned()
            .collect())
    }

    fn fetch_punches(&self, competitor_id: CompetitorId) -> Result<Vec<Punch>, StoreError> {
        if !self.competitors.contains_key(&competitor_id) {
            return Err(StoreError::MissingCompetitor(competitor_id));
        }
        Ok(self.punches(competitor_id).to_vec())
    }

    fn fetch_manual_override(&self, competitor_id: CompetitorId) -> Result<Option<RaceStatus>, StoreError> {
        self.competitor(competitor_id)
            .map(|c| c.manual_status)
            .ok_or(StoreError::MissingCompetitor(competitor_id))
    }

    fn check_si_card_unique(&self, si_number: SiNumber, event_id: EventId) -> bool {
        EventStore::check_si_card_unique(self, si_number, event_id)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
