//! Immutable course view derived from a category's control points.

use std::hash::{DefaultHasher, Hash, Hasher};

use hashbrown::HashSet;

use crate::{
    entity::Category,
    error::CourseError,
    types::{CategoryId, RaceTime, ScoringMode, StationCode},
};

/// A run of control points closed by a separator (or the course end).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Position of this segment on the course.
    pub index: usize,
    /// Non-beacon codes in the order they must be punched.
    pub required: Vec<StationCode>,
    /// Beacon codes, any order.
    pub optional: HashSet<StationCode>,
}

impl Segment {
    /// Returns true when `code` belongs to this segment.
    pub fn contains(&self, code: StationCode) -> bool {
        self.optional.contains(&code) || self.required.contains(&code)
    }
}

/// Segmented course of one category version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseDefinition {
    category_id: CategoryId,
    segments: Vec<Segment>,
    scoring: ScoringMode,
    time_limit: Option<RaceTime>,
    fingerprint: u64,
}

impl CourseDefinition {
    /// Builds the course for `category`, rejecting structurally invalid lists.
    pub fn build(category: &Category) -> Result<Self, CourseError> {
        if category.control_points.is_empty() {
            return Err(CourseError::Empty(category.id));
        }

        let mut points = category.control_points.clone();
        points.sort_by_key(|p| p.order);

        let mut codes = HashSet::new();
        for pair in points.windows(2) {
            if pair[0].order == pair[1].order {
                return Err(CourseError::DuplicateOrderIndex {
                    category: category.id,
                    order: pair[0].order,
                });
            }
        }
        for p in &points {
            if !codes.insert(p.code) {
                return Err(CourseError::DuplicateStationCode { code: p.code });
            }
            if p.separator && p.beacon {
                return Err(CourseError::SeparatorBeacon { code: p.code });
            }
        }
        for p in [&points[0], &points[points.len() - 1]] {
            if p.separator {
                return Err(CourseError::SeparatorAtBoundary { code: p.code });
            }
        }

        let mut segments = Vec::new();
        let mut current = Segment {
            index: 0,
            required: Vec::new(),
            optional: HashSet::new(),
        };
        for p in &points {
            if p.beacon {
                current.optional.insert(p.code);
            } else {
                current.required.push(p.code);
            }
            if p.separator {
                let next = Segment {
                    index: current.index + 1,
                    required: Vec::new(),
                    optional: HashSet::new(),
                };
                segments.push(std::mem::replace(&mut current, next));
            }
        }
        segments.push(current);

        let mut hasher = DefaultHasher::new();
        category.id.hash(&mut hasher);
        points.hash(&mut hasher);
        category.scoring.hash(&mut hasher);
        category.time_limit.hash(&mut hasher);

        Ok(Self {
            category_id: category.id,
            segments,
            scoring: category.scoring,
            time_limit: category.time_limit,
            fingerprint: hasher.finish(),
        })
    }

    /// Category this course was built from.
    pub fn category_id(&self) -> CategoryId {
        self.category_id
    }

    /// Segments in course order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Scoring mode of the category.
    pub fn scoring(&self) -> ScoringMode {
        self.scoring
    }

    /// Time limit of the category, if any.
    pub fn time_limit(&self) -> Option<RaceTime> {
        self.time_limit
    }

    /// Identity of this category version; changes whenever the course does.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Required codes across all segments, in course order.
    pub fn required_codes(&self) -> impl Iterator<Item = StationCode> + '_ {
        self.segments.iter().flat_map(|s| s.required.iter().copied())
    }

    /// Number of required codes across all segments.
    pub fn required_len(&self) -> usize {
        self.segments.iter().map(|s| s.required.len()).sum()
    }

    /// Segment index that owns `code`.
    pub fn segment_of(&self, code: StationCode) -> Option<usize> {
        self.segments.iter().position(|s| s.contains(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ControlPointSpec;

    fn category(points: Vec<ControlPointSpec>) -> Category {
        Category {
            id: 3,
            event_id: 1,
            name: "M21".to_string(),
            control_points: points,
            time_limit: None,
            scoring: ScoringMode::TimeBased,
        }
    }

    #[test]
    fn splits_at_separators_and_collects_beacons() {
        let course = CourseDefinition::build(&category(vec![
            ControlPointSpec::control(1, 31),
            ControlPointSpec::beacon(2, 41),
            ControlPointSpec::separator(3, 50),
            ControlPointSpec::beacon(4, 42),
            ControlPointSpec::control(5, 32),
        ]))
        .unwrap();

        let segs = course.segments();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].required, vec![31, 50]);
        assert!(segs[0].optional.contains(&41));
        assert_eq!(segs[1].index, 1);
        assert_eq!(segs[1].required, vec![32]);
        assert!(segs[1].optional.contains(&42));
        assert_eq!(course.required_codes().collect::<Vec<_>>(), vec![31, 50, 32]);
        assert_eq!(course.segment_of(42), Some(1));
    }

    #[test]
    fn sorts_points_by_order_index() {
        let course = CourseDefinition::build(&category(vec![
            ControlPointSpec::control(3, 33),
            ControlPointSpec::control(1, 31),
            ControlPointSpec::control(2, 32),
        ]))
        .unwrap();
        assert_eq!(course.segments()[0].required, vec![31, 32, 33]);
    }

    #[test]
    fn rejects_structurally_invalid_lists() {
        assert_eq!(
            CourseDefinition::build(&category(vec![])),
            Err(CourseError::Empty(3))
        );
        assert_eq!(
            CourseDefinition::build(&category(vec![
                ControlPointSpec::control(1, 31),
                ControlPointSpec::control(1, 32),
            ])),
            Err(CourseError::DuplicateOrderIndex {
                category: 3,
                order: 1
            })
        );
        assert_eq!(
            CourseDefinition::build(&category(vec![
                ControlPointSpec::separator(1, 31),
                ControlPointSpec::control(2, 32),
            ])),
            Err(CourseError::SeparatorAtBoundary { code: 31 })
        );
        assert_eq!(
            CourseDefinition::build(&category(vec![
                ControlPointSpec::control(1, 31),
                ControlPointSpec::separator(2, 32),
            ])),
            Err(CourseError::SeparatorAtBoundary { code: 32 })
        );
    }

    #[test]
    fn fingerprint_tracks_course_changes() {
        let a = CourseDefinition::build(&category(vec![ControlPointSpec::control(1, 31)])).unwrap();
        let b = CourseDefinition::build(&category(vec![ControlPointSpec::control(1, 31)])).unwrap();
        let c = CourseDefinition::build(&category(vec![ControlPointSpec::beacon(1, 31)])).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
