//! Punch reconciliation and result engine.
//!
//! Pipeline: raw punches -> [`normalize`] -> [`validate`] (per competitor)
//! -> [`aggregate`] (per category). Everything here is synchronous and pure;
//! the [`projector`] decides when a category has to be recomputed.

/// Category-level ranking and result rows.
pub mod aggregate;
/// Engine tunables.
pub mod config;
/// Punch ordering and de-duplication.
pub mod normalize;
/// Recomputation of category results after store mutations.
pub mod projector;
/// Collaborator interfaces consumed by the engine.
pub mod traits;
/// Course matching state machine.
pub mod validate;

use tracing::debug;

use crate::{
    course::CourseDefinition,
    entity::Competitor,
    punch::Punch,
    types::RaceStatus,
};

use self::{
    aggregate::ResultRow,
    config::EngineConfig,
    normalize::NormalizedSequence,
    validate::{ClassifiedPunch, ValidatedRun},
};

/// A competitor together with its raw punch set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompetitorPunches {
    /// Competitor record, including any manual status.
    pub competitor: Competitor,
    /// Raw, unordered punches.
    pub punches: Vec<Punch>,
}

/// Stateless façade over the reconciliation pipeline.
#[derive(Debug, Clone, Default)]
pub struct ResultEngine {
    config: EngineConfig,
}

impl ResultEngine {
    /// Creates an engine with `config`.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Orders and de-duplicates one competitor's punches.
    pub fn normalize(&self, punches: &[Punch]) -> NormalizedSequence {
        normalize::normalize(punches, &self.config)
    }

    /// Classifies a normalized sequence against `course`.
    pub fn validate(
        &self,
        course: &CourseDefinition,
        sequence: &NormalizedSequence,
    ) -> (RaceStatus, Vec<ClassifiedPunch>) {
        validate::validate(course, sequence).into_parts()
    }

    /// Normalizes and validates one competitor, honouring the drawn start time.
    pub fn evaluate(&self, course: &CourseDefinition, entry: &CompetitorPunches) -> ValidatedRun {
        let sequence = self.normalize(&entry.punches);
        validate::validate_with_start(course, &sequence, entry.competitor.start_time)
    }

    /// Computes the ranked rows of one category.
    pub fn compute_category(
        &self,
        course: &CourseDefinition,
        competitors: &[CompetitorPunches],
    ) -> Vec<ResultRow> {
        let runs: Vec<ValidatedRun> = competitors.iter().map(|c| self.evaluate(course, c)).collect();
        let pairs: Vec<_> = competitors
            .iter()
            .map(|c| &c.competitor)
            .zip(runs.iter())
            .collect();
        debug!(
            category_id = course.category_id(),
            competitors = competitors.len(),
            "computing category results"
        );
        aggregate::aggregate(course, &pairs)
    }
}
