//! Competition ranking within (season, round) groups.

use std::collections::BTreeMap;

use anyhow::Result;
use pitwall_core::{Record, Value};

use crate::EnrichmentHook;

/// One participant's metric in one round. Smaller is better.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub season: i32,
    pub round: u32,
    pub participant: String,
    pub metric: Option<f64>,
}

/// Standard competition ranking ("1224") per group, in input order.
///
/// Ties share the lowest rank and the next distinct metric resumes at `rank + tie_count`.
/// A missing or non-finite metric gets no rank and does not shift its siblings.
pub fn rank_min(measurements: &[Measurement]) -> Vec<Option<u32>> {
    let mut groups: BTreeMap<(i32, u32), Vec<(usize, f64)>> = BTreeMap::new();
    for (idx, m) in measurements.iter().enumerate() {
        if let Some(metric) = m.metric.filter(|v| v.is_finite()) {
            groups.entry((m.season, m.round)).or_default().push((idx, metric));
        }
    }

    let mut ranks = vec![None; measurements.len()];
    for members in groups.values_mut() {
        members.sort_by(|a, b| a.1.total_cmp(&b.1));
        let mut rank = 0u32;
        let mut previous: Option<f64> = None;
        for (pos, (idx, metric)) in members.iter().enumerate() {
            if previous != Some(*metric) {
                rank = pos as u32 + 1;
                previous = Some(*metric);
            }
            ranks[*idx] = Some(rank);
        }
    }
    ranks
}

/// Writes a `rank_min` rank into each record, read from `metric_field` and grouped by the
/// records' `season` and `round` fields. Unranked records get an explicit null.
pub struct RankingHook {
    participant_field: String,
    metric_field: String,
    rank_field: String,
}

impl RankingHook {
    pub fn new(
        participant_field: impl Into<String>,
        metric_field: impl Into<String>,
        rank_field: impl Into<String>,
    ) -> Self {
        Self {
            participant_field: participant_field.into(),
            metric_field: metric_field.into(),
            rank_field: rank_field.into(),
        }
    }

    pub fn race_pace() -> Self {
        Self::new("driver", "avg_laptime", "race_pace_position")
    }

    fn measurement(&self, record: &Record) -> Measurement {
        Measurement {
            season: record.int("season").unwrap_or_default() as i32,
            round: record.int("round").unwrap_or_default() as u32,
            participant: record
                .get(&self.participant_field)
                .map(Value::to_string)
                .unwrap_or_default(),
            metric: record.float(&self.metric_field),
        }
    }
}

impl EnrichmentHook for RankingHook {
    fn name(&self) -> &str {
        "ranking"
    }

    fn apply(&self, mut records: Vec<Record>) -> Result<Vec<Record>> {
        let measurements: Vec<_> = records.iter().map(|r| self.measurement(r)).collect();
        for (record, rank) in records.iter_mut().zip(rank_min(&measurements)) {
            record.set(self.rank_field.as_str(), rank);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(season: i32, round: u32, who: &str, metric: Option<f64>) -> Measurement {
        Measurement {
            season,
            round,
            participant: who.to_string(),
            metric,
        }
    }

    #[test]
    fn ties_share_the_lowest_rank() {
        let ranks = rank_min(&[
            m(2025, 1, "A", Some(10.0)),
            m(2025, 1, "B", Some(10.0)),
            m(2025, 1, "C", Some(11.0)),
        ]);
        assert_eq!(ranks, vec![Some(1), Some(1), Some(3)]);
    }

    #[test]
    fn missing_metrics_are_unranked_without_gaps() {
        let ranks = rank_min(&[
            m(2025, 1, "A", Some(92.1)),
            m(2025, 1, "B", None),
            m(2025, 1, "C", Some(f64::NAN)),
            m(2025, 1, "D", Some(91.7)),
        ]);
        assert_eq!(ranks, vec![Some(2), None, None, Some(1)]);
    }

    #[test]
    fn groups_rank_independently() {
        let ranks = rank_min(&[
            m(2025, 1, "A", Some(90.0)),
            m(2025, 2, "A", Some(99.0)),
            m(2025, 1, "B", Some(91.0)),
            m(2025, 2, "B", Some(95.0)),
            m(2024, 2, "A", Some(120.0)),
        ]);
        assert_eq!(ranks, vec![Some(1), Some(2), Some(2), Some(1), Some(1)]);
    }

    #[test]
    fn hook_writes_rank_and_explicit_null() {
        let records = vec![
            Record::new()
                .with("season", 2025)
                .with("round", 1)
                .with("driver", "VER")
                .with("avg_laptime", 82.5),
            Record::new()
                .with("season", 2025)
                .with("round", 1)
                .with("driver", "NOR")
                .with("avg_laptime", 82.0),
            Record::new()
                .with("season", 2025)
                .with("round", 1)
                .with("driver", "DOO")
                .with("avg_laptime", Value::Null),
        ];

        let ranked = RankingHook::race_pace().apply(records).unwrap();
        assert_eq!(ranked[0].int("race_pace_position"), Some(2));
        assert_eq!(ranked[1].int("race_pace_position"), Some(1));
        assert_eq!(ranked[2].get("race_pace_position"), Some(&Value::Null));
    }
}
