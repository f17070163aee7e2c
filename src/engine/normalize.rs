//! Canonical ordering and de-duplication of a competitor's punches.

use hashbrown::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::{
    error::EngineError,
    punch::Punch,
    types::{PunchKind, PunchStatus, RaceTime, StationCode},
};

use super::config::EngineConfig;

/// Time-ordered punch sequence for one competitor.
///
/// `punches` holds every usable record, duplicates included and marked
/// [`PunchStatus::Duplicate`]. Exact copies and malformed records are kept
/// aside for audit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedSequence {
    /// Canonically ordered records.
    pub punches: Vec<Punch>,
    /// Exact copies of an earlier record, dropped from processing.
    pub discarded: Vec<Punch>,
    /// Records excluded because required fields are missing.
    pub malformed: Vec<EngineError>,
}

impl NormalizedSequence {
    /// Returns true when no usable record remains.
    pub fn is_empty(&self) -> bool {
        self.punches.is_empty()
    }

    /// Records still eligible for course matching.
    pub fn valid(&self) -> impl Iterator<Item = &Punch> {
        self.punches.iter().filter(|p| p.status == PunchStatus::Valid)
    }
}

/// Sorts, de-duplicates and flags re-punches in `raw`.
pub fn normalize(raw: &[Punch], config: &EngineConfig) -> NormalizedSequence {
    let mut out = NormalizedSequence::default();
    let mut usable = Vec::with_capacity(raw.len());

    for punch in raw {
        if punch.kind == PunchKind::Control && punch.code.is_none() {
            warn!(punch_id = punch.id, competitor_id = punch.competitor_id, "control punch without station code");
            out.malformed.push(EngineError::MalformedPunch {
                punch_id: punch.id,
                reason: "control punch without station code".to_string(),
            });
            continue;
        }
        let mut punch = punch.clone();
        punch.status = PunchStatus::Valid;
        usable.push(punch);
    }

    usable.sort_by_key(|p| (p.time, p.kind, p.code, p.id));

    let mut seen: HashSet<(PunchKind, Option<StationCode>, RaceTime)> = HashSet::new();
    let mut last_valid: HashMap<StationCode, RaceTime> = HashMap::new();

    for mut punch in usable {
        if !seen.insert((punch.kind, punch.code, punch.time)) {
            debug!(punch_id = punch.id, "dropping exact duplicate punch");
            out.discarded.push(punch);
            continue;
        }

        if let (PunchKind::Control, Some(code)) = (punch.kind, punch.code) {
            match last_valid.get(&code) {
                Some(prev) if punch.time - prev < config.min_repunch_interval => {
                    debug!(punch_id = punch.id, code, "re-punch inside minimum interval");
                    punch.status = PunchStatus::Duplicate;
                }
                _ => {
                    last_valid.insert(code, punch.time);
                }
            }
        }

        out.punches.push(punch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(interval: RaceTime) -> EngineConfig {
        EngineConfig {
            min_repunch_interval: interval,
        }
    }

    #[test]
    fn orders_by_time_then_record_priority() {
        let raw = vec![
            Punch::finish(1, 7, 300),
            Punch::control(2, 7, 31, 100),
            Punch::new(3, 7, PunchKind::Clear, None, 0),
            Punch::start(4, 7, 0),
        ];
        let seq = normalize(&raw, &cfg(10));
        let ids: Vec<_> = seq.punches.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
    }

    #[test]
    fn drops_exact_copies_and_flags_repunches() {
        let raw = vec![
            Punch::start(1, 7, 0),
            Punch::control(2, 7, 31, 100),
            Punch::control(3, 7, 31, 100),
            Punch::control(4, 7, 31, 105),
            Punch::control(5, 7, 31, 130),
        ];
        let seq = normalize(&raw, &cfg(10));

        assert_eq!(seq.discarded.iter().map(|p| p.id).collect::<Vec<_>>(), vec![3]);
        let statuses: Vec<_> = seq.punches.iter().map(|p| (p.id, p.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (1, PunchStatus::Valid),
                (2, PunchStatus::Valid),
                (4, PunchStatus::Duplicate),
                (5, PunchStatus::Valid),
            ]
        );
        assert_eq!(seq.valid().count(), 3);
    }

    #[test]
    fn repunch_window_is_measured_from_last_valid_punch() {
        let raw = vec![
            Punch::control(1, 7, 31, 100),
            Punch::control(2, 7, 31, 108),
            Punch::control(3, 7, 31, 112),
        ];
        let seq = normalize(&raw, &cfg(10));
        let statuses: Vec<_> = seq.punches.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            vec![PunchStatus::Valid, PunchStatus::Duplicate, PunchStatus::Valid]
        );
    }

    #[test]
    fn malformed_control_is_excluded_and_reported() {
        let raw = vec![
            Punch::start(1, 7, 0),
            Punch::new(2, 7, PunchKind::Control, None, 50),
            Punch::finish(3, 7, 90),
        ];
        let seq = normalize(&raw, &cfg(10));
        assert_eq!(seq.punches.len(), 2);
        assert!(matches!(
            seq.malformed.as_slice(),
            [EngineError::MalformedPunch { punch_id: 2, .. }]
        ));
    }

    #[test]
    fn engine_assigned_status_replaces_source_status() {
        let mut p = Punch::control(1, 7, 31, 10);
        p.status = PunchStatus::Invalid;
        let seq = normalize(&[p], &cfg(10));
        assert_eq!(seq.punches[0].status, PunchStatus::Valid);
    }
}
