use std::path::{Path, PathBuf};

use pitwall_adapters::{
    driver_records, race_pace_records, CalendarProvider, ErgastProvider, FixtureTransport,
    LapFilter, UpstreamProvider,
};

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/ergast")
}

#[test]
fn fixture_tree_covers_both_seasons() {
    let root = fixtures_root();
    for resource in [
        "2024/races.json",
        "2025/drivers.json",
        "2025/driverStandings.json",
        "2025/constructorStandings.json",
        "2025/races.json",
        "2025/1/results.json",
        "2025/1/laps.json",
        "2025/2/results.json",
        "2025/2/laps.json",
    ] {
        assert!(root.join(resource).exists(), "missing fixture {resource}");
    }
}

#[tokio::test]
async fn sprint_round_produces_race_pace_for_every_classified_driver() {
    let provider = ErgastProvider::new(FixtureTransport::new(fixtures_root()));

    let events = provider.event_schedule(2025).await.unwrap();
    let shanghai = events.iter().find(|e| e.round == 2).unwrap();
    let results = provider.race_results(2025, 2).await.unwrap();
    let laps = provider.lap_timings(2025, 2).await.unwrap();

    let records = race_pace_records(
        shanghai.season,
        shanghai.round,
        &shanghai.name,
        &results,
        &laps,
        &LapFilter::default(),
    );
    let mut ids: Vec<_> = records
        .iter()
        .filter_map(|r| r.text("race_pace_id").map(str::to_string))
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["2025_2_NOR", "2025_2_PIA", "2025_2_VER"]);
}

#[tokio::test]
async fn keeping_every_driver_retains_reserve_entries() {
    let provider = ErgastProvider::new(FixtureTransport::new(fixtures_root()));
    let drivers = provider.drivers(2025).await.unwrap();
    let standings = provider.driver_standings(2025).await.unwrap();

    let records = driver_records(&drivers, &standings, &[]);
    let doohan = records
        .iter()
        .find(|r| r.text("driverCode") == Some("DOO"))
        .unwrap();
    assert_eq!(doohan.text("teamCode"), Some("alpine"));
    assert_eq!(doohan.text("team"), Some("Alpine"));
}
