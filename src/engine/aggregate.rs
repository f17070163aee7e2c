//! Category-level elapsed times, splits and ranking.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{
    course::CourseDefinition,
    entity::Competitor,
    types::{CompetitorId, RaceStatus, RaceTime, ScoringMode, SiNumber},
};

use super::validate::ValidatedRun;

/// Published result of one competitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Competitor the row belongs to.
    pub competitor_id: CompetitorId,
    /// Card number, used to order unranked rows.
    pub si_number: Option<SiNumber>,
    /// Finish minus start (time-based categories only).
    pub elapsed: Option<RaceTime>,
    /// Finish minus start, kept for score-based tie-breaks.
    pub run_time: Option<RaceTime>,
    /// Leg times in course order; the last leg ends at the finish.
    pub splits: Vec<Option<RaceTime>>,
    /// Time spent in each segment.
    pub segment_times: Vec<Option<RaceTime>>,
    /// Points (score-based categories only).
    pub score: Option<u32>,
    /// Status derived from the punches.
    pub computed_status: RaceStatus,
    /// Status used for display and ranking.
    pub final_status: RaceStatus,
    /// Place within the category; `None` for unranked rows.
    pub rank: Option<u32>,
}

fn leg_times(start: Option<RaceTime>, marks: &[Option<RaceTime>]) -> Vec<Option<RaceTime>> {
    let mut prev = start;
    marks
        .iter()
        .map(|t| {
            let split = prev.zip(*t).map(|(a, b)| b - a);
            prev = *t;
            split
        })
        .collect()
}

fn splits(run: &ValidatedRun) -> Vec<Option<RaceTime>> {
    let mut marks = run.required_times.clone();
    marks.push(run.finish);
    leg_times(run.start, &marks)
}

fn segment_times(course: &CourseDefinition, run: &ValidatedRun) -> Vec<Option<RaceTime>> {
    let mut marks = Vec::with_capacity(course.segments().len());
    let mut offset = 0;
    for (i, seg) in course.segments().iter().enumerate() {
        offset += seg.required.len();
        if i + 1 == course.segments().len() {
            marks.push(run.finish);
        } else {
            marks.push(run.required_times[offset - 1]);
        }
    }
    leg_times(run.start, &marks)
}

/// Builds the unranked row for one competitor.
pub fn result_row(course: &CourseDefinition, competitor: &Competitor, run: &ValidatedRun) -> ResultRow {
    let run_time = run.start.zip(run.finish).map(|(s, f)| f - s);
    let time_based = course.scoring() == ScoringMode::TimeBased;
    ResultRow {
        competitor_id: competitor.id,
        si_number: competitor.si_number,
        elapsed: run_time.filter(|_| time_based),
        run_time,
        splits: splits(run),
        segment_times: segment_times(course, run),
        score: (!time_based).then_some(run.score),
        computed_status: run.status,
        final_status: competitor.manual_status.unwrap_or(run.status),
        rank: None,
    }
}

fn none_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn performance(scoring: ScoringMode, a: &ResultRow, b: &ResultRow) -> Ordering {
    match scoring {
        ScoringMode::TimeBased => none_last(a.elapsed, b.elapsed),
        ScoringMode::ScoreBased => b
            .score
            .cmp(&a.score)
            .then_with(|| none_last(a.run_time, b.run_time)),
    }
}

fn tiebreak(a: &ResultRow, b: &ResultRow) -> Ordering {
    none_last(a.si_number, b.si_number).then(a.competitor_id.cmp(&b.competitor_id))
}

/// Orders `rows` and assigns ranks to the OK group.
///
/// Rows with equal performance share a rank; the next rank skips accordingly.
pub fn rank_rows(scoring: ScoringMode, mut rows: Vec<ResultRow>) -> Vec<ResultRow> {
    rows.sort_by(|a, b| {
        let group = b.final_status.is_ranked().cmp(&a.final_status.is_ranked());
        group.then_with(|| {
            if a.final_status.is_ranked() {
                performance(scoring, a, b).then_with(|| tiebreak(a, b))
            } else {
                tiebreak(a, b)
            }
        })
    });

    let mut place = 0u32;
    for i in 0..rows.len() {
        if !rows[i].final_status.is_ranked() {
            break;
        }
        let tied = i > 0 && performance(scoring, &rows[i - 1], &rows[i]) == Ordering::Equal;
        if !tied {
            place = i as u32 + 1;
        }
        rows[i].rank = Some(place);
    }
    rows
}

/// Builds and ranks the rows of one category.
pub fn aggregate(course: &CourseDefinition, runs: &[(&Competitor, &ValidatedRun)]) -> Vec<ResultRow> {
    let rows = runs
        .iter()
        .map(|(competitor, run)| result_row(course, competitor, run))
        .collect();
    rank_rows(course.scoring(), rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: CompetitorId, si: Option<SiNumber>, elapsed: Option<RaceTime>, status: RaceStatus) -> ResultRow {
        ResultRow {
            competitor_id: id,
            si_number: si,
            elapsed,
            run_time: elapsed,
            splits: vec![],
            segment_times: vec![],
            score: None,
            computed_status: status,
            final_status: status,
            rank: None,
        }
    }

    #[test]
    fn leg_times_chain_through_missing_marks() {
        assert_eq!(
            leg_times(Some(0), &[Some(100), None, Some(300), Some(320)]),
            vec![Some(100), None, None, Some(20)]
        );
        assert_eq!(leg_times(None, &[Some(5)]), vec![None]);
    }

    #[test]
    fn ok_rows_first_then_by_card_number() {
        let rows = rank_rows(
            ScoringMode::TimeBased,
            vec![
                row(1, Some(30), None, RaceStatus::DidNotFinish),
                row(2, Some(20), Some(500), RaceStatus::Valid),
                row(3, Some(10), Some(900), RaceStatus::Disqualified),
                row(4, Some(40), Some(400), RaceStatus::Valid),
            ],
        );
        let order: Vec<_> = rows.iter().map(|r| (r.competitor_id, r.rank)).collect();
        assert_eq!(order, vec![(4, Some(1)), (2, Some(2)), (3, None), (1, None)]);
    }

    #[test]
    fn equal_times_share_a_place() {
        let rows = rank_rows(
            ScoringMode::TimeBased,
            vec![
                row(1, Some(3), Some(300), RaceStatus::Valid),
                row(2, Some(2), Some(300), RaceStatus::Valid),
                row(3, Some(1), Some(200), RaceStatus::Valid),
                row(4, Some(4), Some(310), RaceStatus::Valid),
            ],
        );
        let order: Vec<_> = rows.iter().map(|r| (r.competitor_id, r.rank)).collect();
        assert_eq!(order, vec![(3, Some(1)), (2, Some(2)), (1, Some(2)), (4, Some(4))]);
    }

    #[test]
    fn score_mode_ranks_by_points_then_time() {
        let mut a = row(1, Some(1), None, RaceStatus::Valid);
        a.score = Some(5);
        a.run_time = Some(900);
        let mut b = row(2, Some(2), None, RaceStatus::Valid);
        b.score = Some(5);
        b.run_time = Some(800);
        let mut c = row(3, Some(3), None, RaceStatus::Valid);
        c.score = Some(7);
        c.run_time = Some(1200);

        let rows = rank_rows(ScoringMode::ScoreBased, vec![a, b, c]);
        let order: Vec<_> = rows.iter().map(|r| (r.competitor_id, r.rank)).collect();
        assert_eq!(order, vec![(3, Some(1)), (2, Some(2)), (1, Some(3))]);
    }
}
