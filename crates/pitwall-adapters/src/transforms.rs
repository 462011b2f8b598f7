//! Pure per-record transforms from provider payloads to store records.

use std::collections::{BTreeMap, HashMap};

use chrono::Duration;
use pitwall_core::{CalendarEvent, Record, Value};
use tracing::debug;

use crate::lookup::{country_alpha2, nationality_codes, team_display_name};
use crate::wire::{ConstructorStanding, DriverStanding, ErgastDriver, ErgastLap, ErgastResult};

/// Assumed race duration used to close an upcoming weekend.
const RACE_DURATION_HOURS: i64 = 3;

fn int_field(raw: Option<&str>) -> Value {
    raw.and_then(|s| s.trim().parse::<i64>().ok()).into()
}

fn float_field(raw: &str) -> Value {
    raw.trim().parse::<f64>().ok().into()
}

fn current_team(standing: &DriverStanding) -> Option<(&str, &str)> {
    standing
        .constructors
        .last()
        .map(|c| (c.constructor_id.as_str(), team_display_name(&c.constructor_id, &c.name)))
}

/// Season drivers joined with their current team from the standings. Drivers whose code is
/// listed in `inactive` are dropped; drivers without a standing keep null team fields.
pub fn driver_records(
    drivers: &[ErgastDriver],
    standings: &[DriverStanding],
    inactive: &[String],
) -> Vec<Record> {
    let teams: HashMap<&str, (&str, &str)> = standings
        .iter()
        .filter_map(|s| Some((s.driver.code.as_deref()?, current_team(s)?)))
        .collect();

    drivers
        .iter()
        .filter(|d| {
            d.code
                .as_deref()
                .map_or(true, |code| !inactive.iter().any(|i| i == code))
        })
        .map(|d| {
            let codes = d.nationality.as_deref().and_then(nationality_codes);
            let team = d.code.as_deref().and_then(|code| teams.get(code));
            Record::new()
                .with("driverId", d.driver_id.as_str())
                .with("driverNumber", int_field(d.permanent_number.as_deref()))
                .with("driverCode", d.code.clone())
                .with("driverUrl", d.url.clone())
                .with("firstName", d.given_name.as_str())
                .with("lastName", d.family_name.as_str())
                .with("dateOfBirth", d.date_of_birth.clone())
                .with("driverNationality", d.nationality.clone())
                .with("nationalityCode2", codes.map(|c| c.0))
                .with("nationalityCode3", codes.map(|c| c.1))
                .with("teamCode", team.map(|t| t.0))
                .with("team", team.map(|t| t.1))
        })
        .collect()
}

pub fn driver_standing_records(standings: &[DriverStanding]) -> Vec<Record> {
    standings
        .iter()
        .map(|s| {
            let codes = s.driver.nationality.as_deref().and_then(nationality_codes);
            let team = current_team(s);
            Record::new()
                .with("position", int_field(s.position.as_deref()))
                .with("driver", s.driver.full_name())
                .with("driverCode", s.driver.code.clone())
                .with("nationality", codes.map(|c| c.1))
                .with("nationalityCode", codes.map(|c| c.0))
                .with("team", team.map(|t| t.1))
                .with("teamCode", team.map(|t| t.0))
                .with("points", float_field(&s.points))
        })
        .collect()
}

pub fn team_standing_records(standings: &[ConstructorStanding]) -> Vec<Record> {
    standings
        .iter()
        .map(|s| {
            let c = &s.constructor;
            let codes = c.nationality.as_deref().and_then(nationality_codes);
            Record::new()
                .with("position", int_field(s.position.as_deref()))
                .with("team", team_display_name(&c.constructor_id, &c.name))
                .with("teamCode", c.constructor_id.as_str())
                .with("nationality", codes.map(|c| c.1))
                .with("nationalityCode", codes.map(|c| c.0))
                .with("points", float_field(&s.points))
        })
        .collect()
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn result_code(result: &ErgastResult) -> String {
    result
        .driver
        .code
        .clone()
        .unwrap_or_else(|| result.driver.driver_id.to_uppercase())
}

fn first_placed<'a>(
    results: &'a [ErgastResult],
    place: impl Fn(&'a ErgastResult) -> Option<&'a str>,
) -> Option<String> {
    results
        .iter()
        .find(|r| place(*r).map(str::trim) == Some("1"))
        .map(result_code)
}

/// One calendar event summarised with its race classification. An event without a winner
/// is still `upcoming`.
pub fn event_record(event: &CalendarEvent, results: &[ErgastResult]) -> Record {
    let mut driver_codes = Vec::new();
    let mut driver_names = Vec::new();
    let mut team_codes = Vec::new();
    let mut team_names = Vec::new();

    for result in results {
        push_unique(&mut driver_codes, &result_code(result));
        push_unique(&mut driver_names, &result.driver.full_name());
        if let Some(c) = &result.constructor {
            push_unique(&mut team_codes, &c.constructor_id);
            push_unique(&mut team_names, team_display_name(&c.constructor_id, &c.name));
        }
    }

    let winner = first_placed(results, |r| r.position.as_deref());
    let pole = first_placed(results, |r| r.grid.as_deref());
    let status = if winner.is_some() { "ended" } else { "upcoming" };

    Record::new()
        .with("event_id", format!("{}_{}_{}", event.season, event.round, event.name))
        .with("season", event.season)
        .with("round", event.round)
        .with("event_name", event.name.as_str())
        .with("location", event.locality.clone())
        .with("country", event.country.clone())
        .with("event_date", event.start)
        .with("event_format", event.format.as_str())
        .with("event_status", status)
        .with("circuit_id", event.circuit_id.clone())
        .with("circuit_name", event.circuit_name.clone())
        .with("n_drivers", driver_codes.len())
        .with("driver_codes", driver_codes)
        .with("driver_names", driver_names)
        .with("n_teams", team_codes.len())
        .with("team_codes", team_codes)
        .with("team_names", team_names)
        .with("winner", winner)
        .with("pole", pole)
}

/// Which laps count towards a driver's race pace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LapFilter {
    pub skip_opening_lap: bool,
    /// Laps slower than `median * slow_lap_ratio` are treated as unrepresentative.
    pub slow_lap_ratio: f64,
}

impl Default for LapFilter {
    fn default() -> Self {
        Self {
            skip_opening_lap: true,
            slow_lap_ratio: 1.07,
        }
    }
}

impl LapFilter {
    pub fn representative(&self, mut laps: Vec<(u32, f64)>) -> Vec<f64> {
        if self.skip_opening_lap {
            laps.retain(|(number, _)| *number > 1);
        }
        let mut times: Vec<f64> = laps.into_iter().map(|(_, t)| t).collect();
        let Some(median) = median(&times) else {
            return times;
        };
        times.retain(|t| *t <= median * self.slow_lap_ratio);
        times
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

fn mean_and_std(values: &[f64]) -> (Option<f64>, Option<f64>) {
    if values.is_empty() {
        return (None, None);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (Some(mean), None);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (Some(mean), Some(var.sqrt()))
}

/// `"1:32.123"` to seconds. Accepts `s.fff`, `m:ss.fff` and `h:mm:ss.fff`.
pub fn parse_lap_time(raw: &str) -> Option<f64> {
    let mut total = 0.0;
    for part in raw.trim().split(':') {
        let v: f64 = part.parse().ok()?;
        if v < 0.0 {
            return None;
        }
        total = total * 60.0 + v;
    }
    total.is_finite().then_some(total)
}

/// Per-driver race pace for one round. Rank is not assigned here.
pub fn race_pace_records(
    season: i32,
    round: u32,
    event_name: &str,
    results: &[ErgastResult],
    laps: &[ErgastLap],
    filter: &LapFilter,
) -> Vec<Record> {
    let mut per_driver: BTreeMap<&str, Vec<(u32, f64)>> = BTreeMap::new();
    for lap in laps {
        let Ok(number) = lap.number.parse::<u32>() else {
            continue;
        };
        for timing in &lap.timings {
            if let Some(secs) = parse_lap_time(&timing.time) {
                per_driver
                    .entry(timing.driver_id.as_str())
                    .or_default()
                    .push((number, secs));
            }
        }
    }

    let by_driver: HashMap<&str, &ErgastResult> = results
        .iter()
        .map(|r| (r.driver.driver_id.as_str(), r))
        .collect();

    let mut records = Vec::new();
    for (driver_id, driver_laps) in per_driver {
        let kept = filter.representative(driver_laps);
        let (mean, std) = mean_and_std(&kept);
        let Some(mean) = mean else {
            debug!(season, round, driver_id, "no representative laps");
            continue;
        };

        let result = by_driver.get(driver_id).copied();
        let code = result
            .map(result_code)
            .unwrap_or_else(|| driver_id.to_uppercase());
        let constructor = result.and_then(|r| r.constructor.as_ref());

        records.push(
            Record::new()
                .with("race_pace_id", format!("{season}_{round}_{code}"))
                .with("season", season)
                .with("round", round)
                .with("event", event_name)
                .with("driver", code)
                .with("driver_first_name", result.map(|r| r.driver.given_name.clone()))
                .with("driver_last_name", result.map(|r| r.driver.family_name.clone()))
                .with("driver_position", int_field(result.and_then(|r| r.position.as_deref())))
                .with("team", constructor.map(|c| c.constructor_id.clone()))
                .with(
                    "team_name",
                    constructor.map(|c| team_display_name(&c.constructor_id, &c.name).to_string()),
                )
                .with("lap_count", kept.len())
                .with("avg_laptime", mean)
                .with("std_laptime", std),
        );
    }
    records
}

pub fn upcoming_gp_record(event: &CalendarEvent) -> Record {
    Record::new()
        .with("id", format!("{}-{}", event.season, event.round))
        .with("season", event.season)
        .with("round", event.round)
        .with("name", event.name.as_str())
        .with("circuitId", event.circuit_id.clone())
        .with("circuit", event.circuit_name.clone())
        .with("countryCode", event.country.as_deref().and_then(country_alpha2))
        .with("country", event.country.clone())
        .with("locality", event.locality.clone())
        .with("startDate", event.weekend_start())
        .with("endDate", event.start + Duration::hours(RACE_DURATION_HOURS))
        .with("format", event.format.as_str())
}

/// Stand-in for the opening round of a season whose calendar is not published yet.
pub fn upcoming_gp_placeholder(season: i32) -> Record {
    Record::new()
        .with("id", format!("{season}-1"))
        .with("season", season)
        .with("round", 1)
        .with("name", format!("Round 1 of the {season} F1 Championship"))
        .with("circuitId", "")
        .with("circuit", "TBD")
        .with("countryCode", "")
        .with("country", "TBD")
        .with("locality", "TBD")
        .with("startDate", Value::Null)
        .with("endDate", Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixture_provider;
    use crate::{calendar_event, UpstreamProvider};
    use chrono::{TimeZone, Utc};

    #[test]
    fn lap_times_parse_in_all_shapes() {
        assert_eq!(parse_lap_time("1:32.500"), Some(92.5));
        assert_eq!(parse_lap_time("59.25"), Some(59.25));
        assert_eq!(parse_lap_time("1:00:01.000"), Some(3601.0));
        assert_eq!(parse_lap_time("1:xx"), None);
    }

    #[test]
    fn lap_filter_drops_opening_and_slow_laps() {
        let filter = LapFilter::default();
        let kept = filter.representative(vec![(1, 110.0), (2, 90.0), (3, 91.0), (4, 120.0), (5, 90.5)]);
        assert_eq!(kept, vec![90.0, 91.0, 90.5]);
    }

    #[test]
    fn single_lap_has_no_deviation() {
        assert_eq!(mean_and_std(&[90.0]), (Some(90.0), None));
        let (mean, std) = mean_and_std(&[90.0, 92.0]);
        assert_eq!(mean, Some(91.0));
        assert!((std.unwrap() - 2f64.sqrt()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn drivers_exclude_inactive_and_join_current_team() {
        let provider = fixture_provider();
        let drivers = provider.drivers(2025).await.unwrap();
        let standings = provider.driver_standings(2025).await.unwrap();

        let records = driver_records(&drivers, &standings, &["DOO".to_string()]);
        let codes: Vec<_> = records.iter().filter_map(|r| r.text("driverCode")).collect();
        assert_eq!(codes, vec!["VER", "NOR", "PIA"]);

        let ver = &records[0];
        assert_eq!(ver.text("team"), Some("Red Bull Racing"));
        assert_eq!(ver.text("teamCode"), Some("red_bull"));
        assert_eq!(ver.text("nationalityCode3"), Some("NLD"));
        assert_eq!(ver.int("driverNumber"), Some(33));
    }

    #[tokio::test]
    async fn standings_carry_codes_and_points() {
        let provider = fixture_provider();
        let drivers = driver_standing_records(&provider.driver_standings(2025).await.unwrap());
        let teams = team_standing_records(&provider.constructor_standings(2025).await.unwrap());

        assert_eq!(drivers[0].text("driver"), Some("Lando Norris"));
        assert_eq!(drivers[0].int("position"), Some(1));
        assert_eq!(drivers[0].float("points"), Some(44.0));
        assert_eq!(drivers[0].text("nationalityCode"), Some("GB"));

        assert_eq!(teams[0].text("teamCode"), Some("mclaren"));
        assert_eq!(teams[0].text("team"), Some("McLaren"));
        assert_eq!(teams[0].text("nationality"), Some("GBR"));
    }

    #[tokio::test]
    async fn event_summarises_classification() {
        let provider = fixture_provider();
        let races = provider.race_schedule(2025).await.unwrap();
        let event = calendar_event(&races[0]).unwrap();
        let results = provider.race_results(2025, 1).await.unwrap();

        let record = event_record(&event, &results);
        assert_eq!(record.text("event_id"), Some("2025_1_Australian Grand Prix"));
        assert_eq!(record.text("winner"), Some("NOR"));
        assert_eq!(record.text("pole"), Some("NOR"));
        assert_eq!(record.text("event_status"), Some("ended"));
        assert_eq!(record.int("n_drivers"), Some(3));
        assert_eq!(record.int("n_teams"), Some(2));

        let future = calendar_event(&races[2]).unwrap();
        let pending = event_record(&future, &[]);
        assert_eq!(pending.text("event_status"), Some("upcoming"));
        assert_eq!(pending.get("winner"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn race_pace_from_fixture_laps() {
        let provider = fixture_provider();
        let results = provider.race_results(2025, 1).await.unwrap();
        let laps = provider.lap_timings(2025, 1).await.unwrap();

        let records = race_pace_records(
            2025,
            1,
            "Australian Grand Prix",
            &results,
            &laps,
            &LapFilter::default(),
        );
        assert_eq!(records.len(), 3);

        let nor = records
            .iter()
            .find(|r| r.text("driver") == Some("NOR"))
            .unwrap();
        assert_eq!(nor.text("race_pace_id"), Some("2025_1_NOR"));
        assert_eq!(nor.int("lap_count"), Some(3));
        assert!((nor.float("avg_laptime").unwrap() - 82.0).abs() < 1e-9);
        assert!(!nor.contains_field("race_pace_position"));
    }

    #[test]
    fn upcoming_record_spans_the_weekend() {
        let start = Utc.with_ymd_and_hms(2025, 4, 6, 5, 0, 0).single().unwrap();
        let fp1 = Utc.with_ymd_and_hms(2025, 4, 4, 2, 30, 0).single().unwrap();
        let event = CalendarEvent {
            season: 2025,
            round: 3,
            name: "Japanese Grand Prix".into(),
            format: pitwall_core::EventFormat::Conventional,
            start,
            first_practice: Some(fp1),
            circuit_id: Some("suzuka".into()),
            circuit_name: Some("Suzuka Circuit".into()),
            locality: Some("Suzuka".into()),
            country: Some("Japan".into()),
        };

        let record = upcoming_gp_record(&event);
        assert_eq!(record.text("id"), Some("2025-3"));
        assert_eq!(record.text("countryCode"), Some("JP"));
        assert_eq!(record.get("startDate"), Some(&Value::Timestamp(fp1)));
        assert_eq!(
            record.get("endDate"),
            Some(&Value::Timestamp(start + Duration::hours(3)))
        );

        let placeholder = upcoming_gp_placeholder(2026);
        assert_eq!(placeholder.text("id"), Some("2026-1"));
        assert_eq!(
            placeholder.text("name"),
            Some("Round 1 of the 2026 F1 Championship")
        );
    }
}
