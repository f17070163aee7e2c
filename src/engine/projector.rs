use std::hash::{DefaultHasher, Hash, Hasher};

use hashbrown::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    course::CourseDefinition,
    entity::Competitor,
    error::EngineError,
    op::{Op, StoredOp},
    punch::Punch,
    types::{CategoryId, CompetitorId, RaceTime},
};

use super::{
    aggregate::{self, ResultRow},
    traits::DataSource,
    validate::{self, ValidatedRun},
    ResultEngine,
};

/// Failure while recomputing a category.
#[derive(Error, Debug)]
pub enum ProjectorError<E> {
    /// The data source could not supply an entity.
    #[error("data source: {0}")]
    Source(E),
    /// The category's course is unusable.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone)]
struct MemoRun {
    fingerprint: u64,
    run: ValidatedRun,
}

/// Keeps per-category result rows current as store ops arrive.
///
/// Validated runs are memoized per competitor on a fingerprint of
/// (course version, punch set, drawn start), so an op touching one competitor
/// re-validates that competitor only and re-ranks its category.
pub struct ResultProjector {
    engine: ResultEngine,
    runs: HashMap<CompetitorId, MemoRun>,
    members: HashMap<CategoryId, HashSet<CompetitorId>>,
    results: HashMap<CategoryId, Vec<ResultRow>>,
    evaluations: u64,
}

impl ResultProjector {
    /// Creates an empty projector.
    pub fn new(engine: ResultEngine) -> Self {
        Self {
            engine,
            runs: HashMap::new(),
            members: HashMap::new(),
            results: HashMap::new(),
            evaluations: 0,
        }
    }

    /// Ranked rows of a category, once computed.
    pub fn results(&self, category_id: CategoryId) -> Option<&[ResultRow]> {
        self.results.get(&category_id).map(Vec::as_slice)
    }

    /// Number of runs validated from scratch so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Applies `stored` and returns the categories whose rows changed.
    pub fn apply_stored_op<S: DataSource>(
        &mut self,
        source: &S,
        stored: &StoredOp,
    ) -> Result<Vec<CategoryId>, ProjectorError<S::Error>> {
        match &stored.op {
            Op::DeleteCategory { id } => {
                self.forget_category(*id);
                return Ok(vec![*id]);
            }
            Op::DeleteEvent { categories, .. } => {
                for id in categories {
                    self.forget_category(*id);
                }
                return Ok(categories.clone());
            }
            Op::DeleteCompetitor { competitor } => {
                self.runs.remove(&competitor.id);
            }
            _ => {}
        }

        let mut changed = Vec::new();
        for category_id in stored.op.affected_categories() {
            if self.recompute_category(source, category_id)? {
                changed.push(category_id);
            }
        }
        Ok(changed)
    }

    /// Recomputes one category; returns true when its rows changed.
    pub fn recompute_category<S: DataSource>(
        &mut self,
        source: &S,
        category_id: CategoryId,
    ) -> Result<bool, ProjectorError<S::Error>> {
        let category = source.fetch_category(category_id).map_err(ProjectorError::Source)?;
        let course = match CourseDefinition::build(&category) {
            Ok(course) => course,
            Err(err) => {
                warn!(category_id, %err, "category has no usable course");
                self.results.remove(&category_id);
                return Err(EngineError::from(err).into());
            }
        };

        let competitors = source
            .fetch_competitors(category_id)
            .map_err(ProjectorError::Source)?;

        let mut entries: Vec<(Competitor, ValidatedRun)> = Vec::with_capacity(competitors.len());
        let mut live: HashSet<CompetitorId> = HashSet::new();
        for mut competitor in competitors {
            let punches = source.fetch_punches(competitor.id).map_err(ProjectorError::Source)?;
            competitor.manual_status = source
                .fetch_manual_override(competitor.id)
                .map_err(ProjectorError::Source)?;
            let run = self.run_for(&course, &competitor, &punches);
            live.insert(competitor.id);
            entries.push((competitor, run));
        }

        let pairs: Vec<_> = entries.iter().map(|(c, r)| (c, r)).collect();
        let rows = aggregate::aggregate(&course, &pairs);
        debug!(category_id, rows = rows.len(), "category recomputed");

        if let Some(old) = self.members.insert(category_id, live) {
            let current = &self.members[&category_id];
            for gone in old.difference(current) {
                self.runs.remove(gone);
            }
        }

        let changed = self.results.get(&category_id) != Some(&rows);
        self.results.insert(category_id, rows);
        Ok(changed)
    }

    fn forget_category(&mut self, id: CategoryId) {
        self.results.remove(&id);
        for competitor_id in self.members.remove(&id).unwrap_or_default() {
            self.runs.remove(&competitor_id);
        }
    }

    fn run_for(&mut self, course: &CourseDefinition, competitor: &Competitor, punches: &[Punch]) -> ValidatedRun {
        let fingerprint = run_fingerprint(course, punches, competitor.start_time);
        if let Some(memo) = self.runs.get(&competitor.id) {
            if memo.fingerprint == fingerprint {
                return memo.run.clone();
            }
        }

        self.evaluations += 1;
        let sequence = self.engine.normalize(punches);
        let run = validate::validate_with_start(course, &sequence, competitor.start_time);
        self.runs.insert(
            competitor.id,
            MemoRun {
                fingerprint,
                run: run.clone(),
            },
        );
        run
    }
}

fn run_fingerprint(course: &CourseDefinition, punches: &[Punch], start: Option<RaceTime>) -> u64 {
    let mut sorted: Vec<&Punch> = punches.iter().collect();
    sorted.sort_by_key(|p| p.id);
    let mut hasher = DefaultHasher::new();
    course.fingerprint().hash(&mut hasher);
    sorted.hash(&mut hasher);
    start.hash(&mut hasher);
    hasher.finish()
}
