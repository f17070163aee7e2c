//! Matches a normalized punch sequence against a course.
//!
//! The run is a small state machine:
//!
//! ```text
//! AwaitingStart -> InSegment(0) -> .. -> InSegment(n) -> AwaitingFinish -> Finished
//! ```
//!
//! A segment is left once its last required code (the separator, for every
//! segment but the last) has been consumed. A FINISH punch ends the run from
//! any started state; whatever is still unconsumed at that point counts as
//! missing.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    course::CourseDefinition,
    punch::Punch,
    types::{PunchKind, PunchStatus, RaceStatus, RaceTime, ScoringMode, StationCode},
};

use super::normalize::NormalizedSequence;

/// Progress of a run through the course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// No start seen yet.
    AwaitingStart,
    /// Working through the required codes of a segment.
    InSegment(usize),
    /// Every required code consumed.
    AwaitingFinish,
    /// Finish punched.
    Finished,
}

/// Why a punch was classified [`PunchStatus::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidReason {
    /// Punched before the start.
    BeforeStart,
    /// Second start record.
    ExtraStart,
    /// Required code punched while an earlier one is still open.
    OutOfOrder,
    /// Code not part of the current segment.
    NotOnCourse,
    /// Required code already passed.
    Revisit,
    /// Punched after the finish.
    AfterFinish,
}

impl InvalidReason {
    /// Returns true when the reason disqualifies a time-based run.
    pub fn escalates(self) -> bool {
        matches!(self, InvalidReason::OutOfOrder)
    }
}

/// A punch with its engine classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedPunch {
    /// Punch with [`Punch::status`] set by the engine.
    pub punch: Punch,
    /// Set when the status is [`PunchStatus::Invalid`].
    pub reason: Option<InvalidReason>,
}

/// Outcome of matching one competitor's sequence against a course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedRun {
    /// Status derived from the punches alone.
    pub status: RaceStatus,
    /// State the run ended in.
    pub final_state: RunState,
    /// Every usable punch in canonical order.
    pub punches: Vec<ClassifiedPunch>,
    /// Start time used for the run.
    pub start: Option<RaceTime>,
    /// Finish time, if the run was finished.
    pub finish: Option<RaceTime>,
    /// Acceptance time of every required code, in course order.
    pub required_times: Vec<Option<RaceTime>>,
    /// Points earned (score-based categories).
    pub score: u32,
}

impl ValidatedRun {
    /// Splits the run into the `(status, classified punches)` pair.
    pub fn into_parts(self) -> (RaceStatus, Vec<ClassifiedPunch>) {
        (self.status, self.punches)
    }

    /// Number of required codes never accepted.
    pub fn missing(&self) -> usize {
        self.required_times.iter().filter(|t| t.is_none()).count()
    }

    /// Returns true when any punch carries `reason`.
    pub fn has_reason(&self, reason: InvalidReason) -> bool {
        self.punches.iter().any(|p| p.reason == Some(reason))
    }
}

struct Cursor<'c> {
    course: &'c CourseDefinition,
    state: RunState,
    pos: usize,
    offsets: Vec<usize>,
    required_times: Vec<Option<RaceTime>>,
    beacons: HashSet<StationCode>,
    start: Option<RaceTime>,
    finish: Option<RaceTime>,
    score: u32,
}

impl<'c> Cursor<'c> {
    fn new(course: &'c CourseDefinition) -> Self {
        let mut offsets = Vec::with_capacity(course.segments().len());
        let mut acc = 0;
        for seg in course.segments() {
            offsets.push(acc);
            acc += seg.required.len();
        }
        Self {
            course,
            state: RunState::AwaitingStart,
            pos: 0,
            offsets,
            required_times: vec![None; acc],
            beacons: HashSet::new(),
            start: None,
            finish: None,
            score: 0,
        }
    }

    fn begin(&mut self, time: RaceTime) {
        self.start = Some(time);
        self.state = RunState::InSegment(0);
        self.pos = 0;
        self.settle();
    }

    /// Leaves every segment whose required codes are all consumed.
    fn settle(&mut self) {
        while let RunState::InSegment(i) = self.state {
            if self.pos < self.course.segments()[i].required.len() {
                break;
            }
            self.pos = 0;
            self.state = if i + 1 < self.course.segments().len() {
                RunState::InSegment(i + 1)
            } else {
                RunState::AwaitingFinish
            };
        }
    }

    fn current_segment(&self) -> usize {
        match self.state {
            RunState::InSegment(i) => i,
            _ => self.course.segments().len() - 1,
        }
    }

    fn scores_at(&self, time: RaceTime) -> bool {
        match (self.course.time_limit(), self.start) {
            (Some(limit), Some(start)) => time - start <= limit,
            _ => true,
        }
    }

    fn control(&mut self, code: StationCode, time: RaceTime) -> Option<InvalidReason> {
        let course = self.course;
        let seg_idx = self.current_segment();
        let seg = &course.segments()[seg_idx];

        if seg.optional.contains(&code) {
            if self.beacons.insert(code) && self.scores_at(time) {
                self.score += 1;
            }
            return None;
        }

        let Some(k) = seg.required.iter().position(|c| *c == code) else {
            return Some(InvalidReason::NotOnCourse);
        };
        let in_progress = matches!(self.state, RunState::InSegment(_));

        if !in_progress || k < self.pos {
            return Some(InvalidReason::Revisit);
        }
        if k > self.pos && self.course.scoring() == ScoringMode::TimeBased {
            return Some(InvalidReason::OutOfOrder);
        }

        // Score-based runs skip ahead; the skipped codes stay missing.
        self.required_times[self.offsets[seg_idx] + k] = Some(time);
        if self.scores_at(time) {
            self.score += 1;
        }
        self.pos = k + 1;
        self.settle();
        None
    }
}

/// Validates `sequence` against `course`.
pub fn validate(course: &CourseDefinition, sequence: &NormalizedSequence) -> ValidatedRun {
    validate_with_start(course, sequence, None)
}

/// Validates `sequence`, using `drawn_start` when the card has no start record.
pub fn validate_with_start(
    course: &CourseDefinition,
    sequence: &NormalizedSequence,
    drawn_start: Option<RaceTime>,
) -> ValidatedRun {
    let mut cursor = Cursor::new(course);
    let has_start = sequence.punches.iter().any(|p| p.kind == PunchKind::Start);
    let has_race_records = sequence
        .punches
        .iter()
        .any(|p| matches!(p.kind, PunchKind::Control | PunchKind::Finish));
    let mut finish_without_start = false;

    if let (false, true, Some(t)) = (has_start, has_race_records, drawn_start) {
        cursor.begin(t);
    }

    let mut punches = Vec::with_capacity(sequence.punches.len());
    for punch in &sequence.punches {
        if punch.status == PunchStatus::Duplicate {
            punches.push(ClassifiedPunch {
                punch: punch.clone(),
                reason: None,
            });
            continue;
        }

        let reason = match (cursor.state, punch.kind) {
            (_, PunchKind::Clear) => None,
            (RunState::InSegment(_) | RunState::AwaitingFinish, PunchKind::Control | PunchKind::Finish)
                if cursor.start.is_some_and(|start| punch.time < start) =>
            {
                Some(InvalidReason::BeforeStart)
            }
            (RunState::AwaitingStart, PunchKind::Start) => {
                cursor.begin(punch.time);
                None
            }
            (RunState::AwaitingStart, PunchKind::Finish) => {
                finish_without_start = true;
                Some(InvalidReason::BeforeStart)
            }
            (RunState::AwaitingStart, PunchKind::Control) => Some(InvalidReason::BeforeStart),
            (RunState::Finished, _) => Some(InvalidReason::AfterFinish),
            (_, PunchKind::Start) => Some(InvalidReason::ExtraStart),
            (_, PunchKind::Finish) => {
                cursor.finish = Some(punch.time);
                cursor.state = RunState::Finished;
                None
            }
            (_, PunchKind::Control) => match punch.code {
                Some(code) => cursor.control(code, punch.time),
                None => Some(InvalidReason::NotOnCourse),
            },
        };

        let mut punch = punch.clone();
        if reason.is_some() {
            punch.status = PunchStatus::Invalid;
        }
        punches.push(ClassifiedPunch { punch, reason });
    }

    let escalated = punches.iter().any(|p| p.reason.is_some_and(InvalidReason::escalates));
    let missing = cursor.required_times.iter().any(|t| t.is_none());

    let status = match (cursor.start, course.scoring()) {
        (None, _) if finish_without_start => RaceStatus::DidNotStart,
        (None, _) if has_race_records => RaceStatus::Disqualified,
        (None, _) => RaceStatus::DidNotStart,
        (Some(_), ScoringMode::ScoreBased) => RaceStatus::Valid,
        (Some(start), ScoringMode::TimeBased) => match cursor.finish {
            None => RaceStatus::DidNotFinish,
            Some(_) if escalated || missing => RaceStatus::Disqualified,
            Some(finish) if course.time_limit().is_some_and(|l| finish - start > l) => {
                RaceStatus::OverTime
            }
            Some(_) => RaceStatus::Valid,
        },
    };

    debug!(
        category_id = course.category_id(),
        ?status,
        state = ?cursor.state,
        score = cursor.score,
        "run validated"
    );

    ValidatedRun {
        status,
        final_state: cursor.state,
        punches,
        start: cursor.start,
        finish: cursor.finish,
        required_times: cursor.required_times,
        score: cursor.score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{config::EngineConfig, normalize::normalize},
        entity::{Category, ControlPointSpec},
    };

    fn course(points: Vec<ControlPointSpec>, scoring: ScoringMode, limit: Option<RaceTime>) -> CourseDefinition {
        CourseDefinition::build(&Category {
            id: 1,
            event_id: 1,
            name: "D21".to_string(),
            control_points: points,
            time_limit: limit,
            scoring,
        })
        .unwrap()
    }

    fn classic() -> CourseDefinition {
        course(
            vec![
                ControlPointSpec::control(1, 31),
                ControlPointSpec::control(2, 32),
                ControlPointSpec::control(3, 33),
            ],
            ScoringMode::TimeBased,
            None,
        )
    }

    fn run(course: &CourseDefinition, punches: Vec<Punch>) -> ValidatedRun {
        validate(course, &normalize(&punches, &EngineConfig::default()))
    }

    #[test]
    fn clean_run_is_valid() {
        let r = run(
            &classic(),
            vec![
                Punch::start(1, 1, 0),
                Punch::control(2, 1, 31, 100),
                Punch::control(3, 1, 32, 210),
                Punch::control(4, 1, 33, 300),
                Punch::finish(5, 1, 320),
            ],
        );
        assert_eq!(r.status, RaceStatus::Valid);
        assert_eq!(r.final_state, RunState::Finished);
        assert_eq!(r.required_times, vec![Some(100), Some(210), Some(300)]);
    }

    #[test]
    fn out_of_order_disqualifies() {
        let r = run(
            &classic(),
            vec![
                Punch::start(1, 1, 0),
                Punch::control(2, 1, 32, 100),
                Punch::control(3, 1, 31, 150),
                Punch::control(4, 1, 33, 300),
                Punch::finish(5, 1, 320),
            ],
        );
        assert_eq!(r.status, RaceStatus::Disqualified);
        assert!(r.has_reason(InvalidReason::OutOfOrder));
        assert_eq!(r.punches[1].punch.status, PunchStatus::Invalid);
    }

    #[test]
    fn foreign_code_does_not_escalate() {
        let r = run(
            &classic(),
            vec![
                Punch::start(1, 1, 0),
                Punch::control(2, 1, 31, 100),
                Punch::control(3, 1, 99, 150),
                Punch::control(4, 1, 32, 210),
                Punch::control(5, 1, 33, 300),
                Punch::finish(6, 1, 320),
            ],
        );
        assert_eq!(r.status, RaceStatus::Valid);
        assert_eq!(r.punches[2].reason, Some(InvalidReason::NotOnCourse));
    }

    #[test]
    fn missing_finish_is_dnf() {
        let r = run(
            &classic(),
            vec![Punch::start(1, 1, 0), Punch::control(2, 1, 31, 100)],
        );
        assert_eq!(r.status, RaceStatus::DidNotFinish);
        assert_eq!(r.final_state, RunState::InSegment(0));
    }

    #[test]
    fn no_start_rules() {
        assert_eq!(run(&classic(), vec![]).status, RaceStatus::DidNotStart);
        assert_eq!(
            run(&classic(), vec![Punch::finish(1, 1, 50)]).status,
            RaceStatus::DidNotStart
        );
        assert_eq!(
            run(&classic(), vec![Punch::control(1, 1, 31, 50)]).status,
            RaceStatus::Disqualified
        );
        assert_eq!(
            run(&classic(), vec![Punch::new(1, 1, PunchKind::Clear, None, 0)]).status,
            RaceStatus::DidNotStart
        );
    }

    #[test]
    fn drawn_start_replaces_missing_start_record() {
        let c = classic();
        let seq = normalize(
            &[
                Punch::control(2, 1, 31, 160),
                Punch::control(3, 1, 32, 210),
                Punch::control(4, 1, 33, 300),
                Punch::finish(5, 1, 320),
            ],
            &EngineConfig::default(),
        );
        let r = validate_with_start(&c, &seq, Some(60));
        assert_eq!(r.status, RaceStatus::Valid);
        assert_eq!(r.start, Some(60));

        let empty = validate_with_start(&c, &NormalizedSequence::default(), Some(60));
        assert_eq!(empty.status, RaceStatus::DidNotStart);
    }

    #[test]
    fn punches_before_drawn_start_do_not_count() {
        let c = classic();
        let seq = normalize(
            &[
                Punch::control(2, 1, 31, 100),
                Punch::control(3, 1, 32, 200),
                Punch::control(4, 1, 33, 1_100),
                Punch::finish(5, 1, 1_200),
            ],
            &EngineConfig::default(),
        );
        let r = validate_with_start(&c, &seq, Some(1_000));
        assert_eq!(r.punches[0].reason, Some(InvalidReason::BeforeStart));
        assert_eq!(r.punches[1].reason, Some(InvalidReason::BeforeStart));
        assert_eq!(r.punches[2].reason, Some(InvalidReason::OutOfOrder));
        assert_eq!(r.required_times, vec![None, None, None]);
        assert_eq!(r.finish, Some(1_200));
        assert_eq!(r.status, RaceStatus::Disqualified);
    }

    #[test]
    fn separator_gates_next_segment() {
        let c = course(
            vec![
                ControlPointSpec::control(1, 31),
                ControlPointSpec::separator(2, 50),
                ControlPointSpec::control(3, 32),
            ],
            ScoringMode::TimeBased,
            None,
        );
        let r = run(
            &c,
            vec![
                Punch::start(1, 1, 0),
                Punch::control(2, 1, 31, 10),
                Punch::control(3, 1, 32, 20),
                Punch::control(4, 1, 50, 30),
                Punch::control(5, 1, 32, 40),
                Punch::finish(6, 1, 50),
            ],
        );
        assert_eq!(r.punches[2].reason, Some(InvalidReason::NotOnCourse));
        assert_eq!(r.required_times, vec![Some(10), Some(30), Some(40)]);
        assert_eq!(r.status, RaceStatus::Valid);
    }

    #[test]
    fn finish_with_missing_control_disqualifies() {
        let r = run(
            &classic(),
            vec![
                Punch::start(1, 1, 0),
                Punch::control(2, 1, 31, 100),
                Punch::control(3, 1, 32, 210),
                Punch::finish(4, 1, 320),
            ],
        );
        assert_eq!(r.status, RaceStatus::Disqualified);
        assert_eq!(r.missing(), 1);
    }

    #[test]
    fn beacons_are_optional_and_unordered() {
        let c = course(
            vec![
                ControlPointSpec::beacon(1, 41),
                ControlPointSpec::control(2, 31),
                ControlPointSpec::beacon(3, 42),
            ],
            ScoringMode::TimeBased,
            None,
        );
        let r = run(
            &c,
            vec![
                Punch::start(1, 1, 0),
                Punch::control(2, 1, 42, 10),
                Punch::control(3, 1, 31, 20),
                Punch::control(4, 1, 41, 30),
                Punch::finish(5, 1, 40),
            ],
        );
        assert_eq!(r.status, RaceStatus::Valid);
        assert!(r.punches.iter().all(|p| p.reason.is_none()));
    }

    #[test]
    fn time_limit_marks_over_time() {
        let c = course(
            vec![ControlPointSpec::control(1, 31)],
            ScoringMode::TimeBased,
            Some(100),
        );
        let r = run(
            &c,
            vec![
                Punch::start(1, 1, 0),
                Punch::control(2, 1, 31, 50),
                Punch::finish(3, 1, 101),
            ],
        );
        assert_eq!(r.status, RaceStatus::OverTime);
    }

    #[test]
    fn score_mode_skips_ahead_and_counts_points() {
        let c = course(
            vec![
                ControlPointSpec::control(1, 31),
                ControlPointSpec::control(2, 32),
                ControlPointSpec::control(3, 33),
                ControlPointSpec::beacon(4, 41),
            ],
            ScoringMode::ScoreBased,
            Some(300),
        );
        let r = run(
            &c,
            vec![
                Punch::start(1, 1, 0),
                Punch::control(2, 1, 32, 100),
                Punch::control(3, 1, 31, 150),
                Punch::control(4, 1, 33, 200),
                Punch::control(5, 1, 41, 350),
            ],
        );
        assert_eq!(r.status, RaceStatus::Valid);
        assert_eq!(r.punches[2].reason, Some(InvalidReason::Revisit));
        assert_eq!(r.required_times, vec![None, Some(100), Some(200)]);
        // beacon at 350 is past the limit
        assert_eq!(r.score, 2);
    }

    #[test]
    fn duplicates_pass_through_unclassified() {
        let r = run(
            &classic(),
            vec![
                Punch::start(1, 1, 0),
                Punch::control(2, 1, 31, 100),
                Punch::control(3, 1, 31, 104),
                Punch::control(4, 1, 32, 210),
                Punch::control(5, 1, 33, 300),
                Punch::finish(6, 1, 320),
            ],
        );
        assert_eq!(r.status, RaceStatus::Valid);
        assert_eq!(r.punches[2].punch.status, PunchStatus::Duplicate);
        assert_eq!(r.punches[2].reason, None);
    }
}
