//! Upstream provider contracts, Ergast-compatible transports, and per-entity record transforms.

mod lookup;
mod transforms;
mod wire;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use pitwall_core::{CalendarEvent, EventFormat};
use pitwall_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

pub use lookup::{country_alpha2, nationality_codes, team_display_name};
pub use transforms::{
    driver_records, driver_standing_records, event_record, parse_lap_time, race_pace_records,
    team_standing_records, upcoming_gp_placeholder, upcoming_gp_record, LapFilter,
};
pub use wire::{
    ConstructorStanding, DriverStanding, ErgastCircuit, ErgastConstructor, ErgastDriver, ErgastLap,
    ErgastLocation, ErgastRace, ErgastResult, LapTiming, SessionTime,
};

use wire::{DriverTablePayload, Envelope, MrData, RaceTablePayload, StandingsTablePayload};

pub const CRATE_NAME: &str = "pitwall-adapters";

pub const DEFAULT_PROVIDER_URL: &str = "https://api.jolpi.ca/ergast/f1";

/// Largest page the public Ergast mirror serves.
const PAGE_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream fetch of {resource} failed: {source}")]
    UpstreamFetch {
        resource: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("upstream payload {resource} could not be decoded: {source}")]
    Decode {
        resource: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: PAGE_LIMIT,
            offset: 0,
        }
    }
}

/// Raw access to Ergast-shaped resources such as `2025/drivers.json`.
#[async_trait]
pub trait ErgastTransport: Send + Sync {
    fn describe(&self) -> String;

    async fn get(&self, resource: &str, page: Page) -> Result<Vec<u8>, AdapterError>;
}

pub struct HttpTransport {
    base_url: String,
    fetcher: HttpFetcher,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> Result<Self, AdapterError> {
        let fetcher = HttpFetcher::new(config).map_err(|e| AdapterError::Message(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetcher,
        })
    }

    fn url_for(&self, resource: &str, page: Page) -> String {
        format!(
            "{}/{}?limit={}&offset={}",
            self.base_url, resource, page.limit, page.offset
        )
    }
}

#[async_trait]
impl ErgastTransport for HttpTransport {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn get(&self, resource: &str, page: Page) -> Result<Vec<u8>, AdapterError> {
        let url = self.url_for(resource, page);
        self.fetcher
            .fetch_bytes(&url)
            .await
            .map_err(|e: FetchError| AdapterError::UpstreamFetch {
                resource: url,
                source: Box::new(e),
            })
    }
}

/// Serves resources from a directory laid out like the API (`<root>/2025/1/laps.json`).
/// Paging is ignored: every file is one complete page.
#[derive(Debug, Clone)]
pub struct FixtureTransport {
    root: PathBuf,
}

impl FixtureTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ErgastTransport for FixtureTransport {
    fn describe(&self) -> String {
        format!("fixtures at {}", self.root.display())
    }

    async fn get(&self, resource: &str, _page: Page) -> Result<Vec<u8>, AdapterError> {
        let path = self.root.join(resource);
        fs::read(&path).map_err(|e| AdapterError::UpstreamFetch {
            resource: path.display().to_string(),
            source: Box::new(e),
        })
    }
}

/// Read-only tabular source for one season's reference data.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    fn describe(&self) -> String;
    async fn drivers(&self, season: i32) -> Result<Vec<ErgastDriver>, AdapterError>;
    async fn driver_standings(&self, season: i32) -> Result<Vec<DriverStanding>, AdapterError>;
    async fn constructor_standings(
        &self,
        season: i32,
    ) -> Result<Vec<ConstructorStanding>, AdapterError>;
    async fn race_schedule(&self, season: i32) -> Result<Vec<ErgastRace>, AdapterError>;
    async fn race_results(&self, season: i32, round: u32) -> Result<Vec<ErgastResult>, AdapterError>;
    async fn lap_timings(&self, season: i32, round: u32) -> Result<Vec<ErgastLap>, AdapterError>;
}

/// Season calendar lookup used for "latest" and "next" event resolution.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn event_schedule(&self, season: i32) -> Result<Vec<CalendarEvent>, AdapterError>;
}

pub struct ErgastProvider<T> {
    transport: T,
}

impl<T: ErgastTransport> ErgastProvider<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn fetch<P: DeserializeOwned>(
        &self,
        resource: &str,
        page: Page,
    ) -> Result<MrData<P>, AdapterError> {
        let bytes = self.transport.get(resource, page).await?;
        let envelope: Envelope<P> =
            serde_json::from_slice(&bytes).map_err(|source| AdapterError::Decode {
                resource: resource.to_string(),
                source,
            })?;
        debug!(resource, bytes = bytes.len(), "decoded upstream payload");
        Ok(envelope.mr_data)
    }

    async fn standings_list(&self, resource: &str) -> Result<Option<wire::StandingsList>, AdapterError> {
        let data: MrData<StandingsTablePayload> = self.fetch(resource, Page::default()).await?;
        Ok(data.table.standings_table.lists.into_iter().next())
    }

    async fn single_race(&self, resource: &str) -> Result<Option<ErgastRace>, AdapterError> {
        let data: MrData<RaceTablePayload> = self.fetch(resource, Page::default()).await?;
        Ok(data.table.race_table.races.into_iter().next())
    }
}

#[async_trait]
impl<T: ErgastTransport> UpstreamProvider for ErgastProvider<T> {
    fn describe(&self) -> String {
        self.transport.describe()
    }

    async fn drivers(&self, season: i32) -> Result<Vec<ErgastDriver>, AdapterError> {
        let data: MrData<DriverTablePayload> =
            self.fetch(&format!("{season}/drivers.json"), Page::default()).await?;
        Ok(data.table.driver_table.drivers)
    }

    async fn driver_standings(&self, season: i32) -> Result<Vec<DriverStanding>, AdapterError> {
        Ok(self
            .standings_list(&format!("{season}/driverStandings.json"))
            .await?
            .map(|list| list.driver_standings)
            .unwrap_or_default())
    }

    async fn constructor_standings(
        &self,
        season: i32,
    ) -> Result<Vec<ConstructorStanding>, AdapterError> {
        Ok(self
            .standings_list(&format!("{season}/constructorStandings.json"))
            .await?
            .map(|list| list.constructor_standings)
            .unwrap_or_default())
    }

    async fn race_schedule(&self, season: i32) -> Result<Vec<ErgastRace>, AdapterError> {
        let data: MrData<RaceTablePayload> =
            self.fetch(&format!("{season}/races.json"), Page::default()).await?;
        Ok(data.table.race_table.races)
    }

    async fn race_results(&self, season: i32, round: u32) -> Result<Vec<ErgastResult>, AdapterError> {
        Ok(self
            .single_race(&format!("{season}/{round}/results.json"))
            .await?
            .map(|race| race.results)
            .unwrap_or_default())
    }

    /// Timings are paged by timing row, so one lap can straddle two pages.
    async fn lap_timings(&self, season: i32, round: u32) -> Result<Vec<ErgastLap>, AdapterError> {
        let resource = format!("{season}/{round}/laps.json");
        let mut laps: BTreeMap<u32, ErgastLap> = BTreeMap::new();
        let mut offset = 0u32;

        loop {
            let page = Page {
                limit: PAGE_LIMIT,
                offset,
            };
            let data: MrData<RaceTablePayload> = self.fetch(&resource, page).await?;
            let total = data.total();
            let mut received = 0u32;

            for race in data.table.race_table.races {
                for lap in race.laps {
                    received += lap.timings.len() as u32;
                    let Ok(number) = lap.number.parse::<u32>() else {
                        warn!(resource, lap = %lap.number, "skipping lap with unreadable number");
                        continue;
                    };
                    laps.entry(number)
                        .or_insert_with(|| ErgastLap {
                            number: lap.number.clone(),
                            timings: Vec::new(),
                        })
                        .timings
                        .extend(lap.timings);
                }
            }

            offset += received;
            if received == 0 || offset >= total {
                break;
            }
        }

        Ok(laps.into_values().collect())
    }
}

#[async_trait]
impl<T: ErgastTransport> CalendarProvider for ErgastProvider<T> {
    async fn event_schedule(&self, season: i32) -> Result<Vec<CalendarEvent>, AdapterError> {
        let races = self.race_schedule(season).await?;
        Ok(races.iter().filter_map(calendar_event).collect())
    }
}

/// Calendar view of a scheduled race. Races whose dates cannot be read are dropped.
pub fn calendar_event(race: &ErgastRace) -> Option<CalendarEvent> {
    let season = race.season.parse().ok()?;
    let round = race.round.parse().ok()?;
    let Some(start) = parse_instant(&race.date, race.time.as_deref()) else {
        warn!(season = %race.season, round = %race.round, date = %race.date, "unreadable race date");
        return None;
    };
    let first_practice = race
        .first_practice
        .as_ref()
        .and_then(|s| parse_instant(&s.date, s.time.as_deref()));
    let location = race.circuit.location.as_ref();

    Some(CalendarEvent {
        season,
        round,
        name: race.race_name.clone(),
        format: if race.sprint.is_some() {
            EventFormat::Sprint
        } else {
            EventFormat::Conventional
        },
        start,
        first_practice,
        circuit_id: Some(race.circuit.circuit_id.clone()),
        circuit_name: Some(race.circuit.circuit_name.clone()),
        locality: location.and_then(|l| l.locality.clone()),
        country: location.and_then(|l| l.country.clone()),
    })
}

/// `2025-03-16` + `04:00:00Z` as a UTC instant; a missing time means midnight.
pub fn parse_instant(date: &str, time: Option<&str>) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
    let time = match time.map(|t| t.trim().trim_end_matches('Z')) {
        Some(t) if !t.is_empty() => NaiveTime::parse_from_str(t, "%H:%M:%S").ok()?,
        _ => NaiveTime::from_hms_opt(0, 0, 0)?,
    };
    Some(date.and_time(time).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::Path;

    pub(crate) fn fixture_provider() -> ErgastProvider<FixtureTransport> {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/ergast");
        ErgastProvider::new(FixtureTransport::new(root))
    }

    #[test]
    fn instants_parse_with_and_without_time() {
        assert_eq!(
            parse_instant("2025-03-16", Some("04:00:00Z")),
            Utc.with_ymd_and_hms(2025, 3, 16, 4, 0, 0).single()
        );
        assert_eq!(
            parse_instant("2025-03-16", None),
            Utc.with_ymd_and_hms(2025, 3, 16, 0, 0, 0).single()
        );
        assert_eq!(parse_instant("16/03/2025", None), None);
    }

    #[test]
    fn http_transport_builds_paged_urls() {
        let transport =
            HttpTransport::new("https://api.jolpi.ca/ergast/f1/", HttpClientConfig::default())
                .unwrap();
        assert_eq!(
            transport.url_for("2025/1/laps.json", Page { limit: 100, offset: 200 }),
            "https://api.jolpi.ca/ergast/f1/2025/1/laps.json?limit=100&offset=200"
        );
    }

    #[tokio::test]
    async fn fixture_schedule_maps_to_calendar_events() {
        let provider = fixture_provider();
        let events = provider.event_schedule(2025).await.unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].key(), (2025, 1));
        assert_eq!(events[0].name, "Australian Grand Prix");
        assert_eq!(events[0].format, EventFormat::Conventional);
        assert_eq!(
            events[0].first_practice,
            Utc.with_ymd_and_hms(2025, 3, 14, 1, 30, 0).single()
        );
        assert_eq!(events[1].format, EventFormat::Sprint);
        assert_eq!(events[2].country.as_deref(), Some("Japan"));
    }

    #[tokio::test]
    async fn fixture_laps_are_grouped_by_lap_number() {
        let provider = fixture_provider();
        let laps = provider.lap_timings(2025, 1).await.unwrap();

        let numbers: Vec<_> = laps.iter().map(|l| l.number.as_str()).collect();
        assert_eq!(numbers, vec!["1", "2", "3", "4", "5"]);
        assert_eq!(laps[1].timings.len(), 3);
    }

    #[tokio::test]
    async fn missing_resources_surface_as_fetch_errors() {
        let provider = fixture_provider();
        let err = provider.drivers(1949).await.unwrap_err();
        assert!(matches!(err, AdapterError::UpstreamFetch { .. }));
    }

    #[tokio::test]
    async fn standings_come_from_the_first_list() {
        let provider = fixture_provider();
        let drivers = provider.driver_standings(2025).await.unwrap();
        let teams = provider.constructor_standings(2025).await.unwrap();

        assert_eq!(drivers.len(), 4);
        assert_eq!(drivers[0].driver.code.as_deref(), Some("NOR"));
        assert_eq!(teams.len(), 3);
        assert_eq!(teams[0].constructor.constructor_id, "mclaren");
    }
}
