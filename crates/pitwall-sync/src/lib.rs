//! Sync pipeline orchestration: configuration, entity registry, enrichment hooks, per-entity
//! extraction, and the optional cron scheduler.

mod ranking;
mod temporal;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use pitwall_adapters::{
    driver_records, driver_standing_records, event_record, race_pace_records,
    team_standing_records, upcoming_gp_placeholder, upcoming_gp_record, AdapterError,
    CalendarProvider, ErgastProvider, FixtureTransport, HttpTransport, LapFilter,
    UpstreamProvider, DEFAULT_PROVIDER_URL,
};
use pitwall_core::{prepare_documents, CalendarEvent, Record};
use pitwall_storage::{
    DocumentStore, HttpClientConfig, MemoryStore, MongoStore, StoreConfig, SyncReport,
    UpsertEngine, UpsertError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use ranking::{rank_min, Measurement, RankingHook};
pub use temporal::{
    resolve_most_recent, resolve_upcoming, ResolveError, Upcoming, DEFAULT_LOOKBACK_SEASONS,
};

pub const CRATE_NAME: &str = "pitwall-sync";

pub const DEFAULT_DATABASE: &str = "visionf1";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mongodb_uri: Option<String>,
    pub database: String,
    /// Season override for every entity except `upcoming_gp`, which always looks ahead of
    /// the run instant. `None` lets each entity pick its own.
    pub season: Option<i32>,
    pub provider_url: String,
    /// Read the provider from a fixture tree instead of HTTP.
    pub fixtures_dir: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub inactive_drivers: Vec<String>,
    pub slow_lap_ratio: f64,
    pub lookback_seasons: u32,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    /// Write into an in-memory store; nothing leaves the process.
    pub dry_run: bool,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        Self {
            mongodb_uri: non_empty("MONGODB_URI"),
            database: non_empty("MONGODB_DB").unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            season: non_empty("PITWALL_SEASON").and_then(|v| v.trim().parse().ok()),
            provider_url: non_empty("PITWALL_PROVIDER_URL")
                .unwrap_or_else(|| DEFAULT_PROVIDER_URL.to_string()),
            fixtures_dir: non_empty("PITWALL_FIXTURES_DIR").map(PathBuf::from),
            http_timeout_secs: non_empty("PITWALL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: non_empty("PITWALL_USER_AGENT")
                .unwrap_or_else(|| "pitwall-sync/0.1".to_string()),
            connect_timeout_secs: non_empty("PITWALL_CONNECT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            inactive_drivers: non_empty("PITWALL_INACTIVE_DRIVERS")
                .map(|v| {
                    v.split(',')
                        .map(|code| code.trim().to_ascii_uppercase())
                        .filter(|code| !code.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["DOO".to_string()]),
            slow_lap_ratio: non_empty("PITWALL_SLOW_LAP_RATIO")
                .and_then(|v| v.parse().ok())
                .filter(|r: &f64| r.is_finite() && *r >= 1.0)
                .unwrap_or(LapFilter::default().slow_lap_ratio),
            lookback_seasons: non_empty("PITWALL_LOOKBACK_SEASONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LOOKBACK_SEASONS),
            scheduler_enabled: non_empty("PITWALL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: non_empty("SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            dry_run: false,
            workspace_root: PathBuf::from("."),
        }
    }

    /// Store address and options. A missing address is a configuration error.
    pub fn store_config(&self) -> Result<StoreConfig, SyncError> {
        let uri = self.mongodb_uri.as_deref().ok_or_else(|| {
            SyncError::Configuration(
                "MONGODB_URI undefined; load .env or export the variable".to_string(),
            )
        })?;
        let mut store = StoreConfig::new(uri, self.database.clone());
        store.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        Ok(store)
    }

    pub fn lap_filter(&self) -> LapFilter {
        LapFilter {
            slow_lap_ratio: self.slow_lap_ratio,
            ..LapFilter::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Upstream(#[from] AdapterError),
    #[error("document store unreachable: {0}")]
    Connectivity(String),
    #[error("{0}")]
    Constraint(String),
    #[error(transparent)]
    NoPastEvent(#[from] ResolveError),
    #[error("enrichment hook `{hook}` failed: {message}")]
    Enrichment { hook: String, message: String },
}

impl From<UpsertError> for SyncError {
    fn from(err: UpsertError) -> Self {
        match err {
            UpsertError::Connectivity(message) => SyncError::Connectivity(message),
            UpsertError::Configuration(message) => SyncError::Configuration(message),
            constraint @ UpsertError::Constraint { .. } => {
                SyncError::Constraint(constraint.to_string())
            }
        }
    }
}

impl SyncError {
    /// Whether later entities in the same run would fail the same way.
    pub fn aborts_run(&self) -> bool {
        matches!(self, SyncError::Configuration(_) | SyncError::Connectivity(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Drivers,
    DriverStandings,
    TeamStandings,
    Events,
    RacePace,
    UpcomingGp,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Drivers,
        EntityKind::DriverStandings,
        EntityKind::TeamStandings,
        EntityKind::Events,
        EntityKind::RacePace,
        EntityKind::UpcomingGp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Drivers => "drivers",
            EntityKind::DriverStandings => "driver_standings",
            EntityKind::TeamStandings => "team_standings",
            EntityKind::Events => "events",
            EntityKind::RacePace => "race_pace",
            EntityKind::UpcomingGp => "upcoming_gp",
        }
    }

    pub fn identity_key(self) -> &'static str {
        match self {
            EntityKind::Drivers | EntityKind::DriverStandings => "driverCode",
            EntityKind::TeamStandings => "teamCode",
            EntityKind::Events => "event_id",
            EntityKind::RacePace => "race_pace_id",
            EntityKind::UpcomingGp => "id",
        }
    }

    pub fn default_collection(self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_ascii_lowercase();
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| format!("unknown entity `{s}`"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityRegistry {
    pub entities: Vec<EntityConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
    pub entity: EntityKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self {
            entities: EntityKind::ALL
                .into_iter()
                .map(|entity| EntityConfig {
                    entity,
                    enabled: true,
                    collection: None,
                    notes: None,
                })
                .collect(),
        }
    }
}

impl EntityRegistry {
    pub const FILE_NAME: &'static str = "entities.yaml";

    /// Reads the registry at `path`; a missing file enables every entity.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> Vec<EntityKind> {
        let mut kinds: Vec<_> = self
            .entities
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.entity)
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    pub fn collection_for(&self, kind: EntityKind) -> String {
        self.entities
            .iter()
            .find(|e| e.entity == kind)
            .and_then(|e| e.collection.clone())
            .unwrap_or_else(|| kind.default_collection().to_string())
    }
}

/// Post-transform, pre-write rewrite of an entity's records.
pub trait EnrichmentHook: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, records: Vec<Record>) -> Result<Vec<Record>>;
}

/// A provider that serves both reference tables and season calendars.
pub trait ReferenceSource: UpstreamProvider + CalendarProvider {}

impl<T: UpstreamProvider + CalendarProvider> ReferenceSource for T {}

/// The fixture tree when one is configured, the HTTP provider otherwise.
pub fn reference_source(config: &SyncConfig) -> Result<Box<dyn ReferenceSource>, SyncError> {
    if let Some(dir) = &config.fixtures_dir {
        return Ok(Box::new(ErgastProvider::new(FixtureTransport::new(dir.clone()))));
    }
    let http = HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    };
    let transport = HttpTransport::new(config.provider_url.clone(), http)
        .map_err(|e| SyncError::Configuration(e.to_string()))?;
    Ok(Box::new(ErgastProvider::new(transport)))
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityRun {
    pub entity: EntityKind,
    pub collection: String,
    pub season: Option<i32>,
    pub report: SyncReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityFailure {
    pub entity: EntityKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub store: String,
    pub runs: Vec<EntityRun>,
    pub failures: Vec<EntityFailure>,
}

impl SyncRunSummary {
    pub fn documents_written(&self) -> u64 {
        self.runs.iter().map(|r| r.report.written()).sum()
    }

    pub fn write_failures(&self) -> usize {
        self.runs.iter().map(|r| r.report.failures.len()).sum()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: EntityRegistry,
    source: Box<dyn ReferenceSource>,
    engine: UpsertEngine<Box<dyn DocumentStore>>,
    hooks: Vec<(EntityKind, Box<dyn EnrichmentHook>)>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: EntityRegistry,
        source: Box<dyn ReferenceSource>,
        store: Box<dyn DocumentStore>,
    ) -> Self {
        Self {
            config,
            registry,
            source,
            engine: UpsertEngine::new(store),
            hooks: vec![(
                EntityKind::RacePace,
                Box::new(RankingHook::race_pace()) as Box<dyn EnrichmentHook>,
            )],
        }
    }

    /// Wires the provider, store, and registry described by `config`.
    ///
    /// The store address is checked before any provider call.
    pub async fn from_config(config: SyncConfig) -> Result<Self, SyncError> {
        let store: Box<dyn DocumentStore> = if config.dry_run {
            Box::new(MemoryStore::new())
        } else {
            let store_config = config.store_config()?;
            Box::new(MongoStore::connect(&store_config).await.map_err(UpsertError::from)?)
        };

        let source = reference_source(&config)?;
        let registry_path = config.workspace_root.join(EntityRegistry::FILE_NAME);
        let registry = EntityRegistry::load(&registry_path)
            .map_err(|e| SyncError::Configuration(format!("{e:#}")))?;

        Ok(Self::new(config, registry, source, store))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Extract, enrich, stamp, and upsert one entity.
    pub async fn run_entity(
        &self,
        entity: EntityKind,
        now: DateTime<Utc>,
    ) -> Result<EntityRun, SyncError> {
        let collection = self.registry.collection_for(entity);
        let (season, mut records) = self.extract(entity, now).await?;

        for (_, hook) in self.hooks.iter().filter(|(kind, _)| *kind == entity) {
            records = hook.apply(records).map_err(|e| SyncError::Enrichment {
                hook: hook.name().to_string(),
                message: format!("{e:#}"),
            })?;
        }

        let documents = prepare_documents(records, now);
        let report = self
            .engine
            .synchronize(documents, entity.identity_key(), &collection)
            .await?;

        if let Some(partial) = report.partial_write_error() {
            warn!(entity = %entity, %partial, "entity synchronized with failures");
        }
        info!(
            entity = %entity,
            collection = %collection,
            season,
            written = report.written(),
            created = report.created,
            failures = report.failures.len(),
            "entity synchronized"
        );

        Ok(EntityRun {
            entity,
            collection,
            season,
            report,
        })
    }

    /// Runs every enabled entity. Store-level failures stop the run; anything else is
    /// recorded and the next entity proceeds.
    pub async fn run_all(&self, now: DateTime<Utc>) -> Result<SyncRunSummary, SyncError> {
        self.run_entities(&self.registry.enabled(), now).await
    }

    pub async fn run_entities(
        &self,
        entities: &[EntityKind],
        now: DateTime<Utc>,
    ) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut runs = Vec::new();
        let mut failures = Vec::new();

        for &entity in entities {
            match self.run_entity(entity, now).await {
                Ok(run) => runs.push(run),
                Err(err) if err.aborts_run() => {
                    error!(%run_id, entity = %entity, %err, "sync run aborted");
                    return Err(err);
                }
                Err(err) => {
                    error!(%run_id, entity = %entity, %err, "entity sync failed");
                    failures.push(EntityFailure {
                        entity,
                        error: err.to_string(),
                    });
                }
            }
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source: self.source.describe(),
            store: self.engine.store().describe(),
            runs,
            failures,
        };
        info!(
            %run_id,
            entities = summary.runs.len(),
            failed_entities = summary.failures.len(),
            written = summary.documents_written(),
            "sync run finished"
        );
        Ok(summary)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.as_str();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_all(Utc::now()).await {
                    error!(%err, "scheduled sync failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    fn explicit_season(&self) -> Option<i32> {
        self.config.season
    }

    /// Season for race-derived entities, plus the last round to include.
    async fn race_window(&self, now: DateTime<Utc>) -> Result<(i32, Option<u32>), SyncError> {
        if let Some(season) = self.explicit_season() {
            return Ok((season, None));
        }
        let (event, season) =
            resolve_most_recent(self.source.as_ref(), now, self.config.lookback_seasons).await?;
        Ok((season, Some(event.round)))
    }

    async fn race_events(
        &self,
        season: i32,
        last_round: Option<u32>,
    ) -> Result<Vec<CalendarEvent>, SyncError> {
        let mut events: Vec<_> = self
            .source
            .event_schedule(season)
            .await?
            .into_iter()
            .filter(|e| e.format.is_competitive())
            .filter(|e| last_round.map_or(true, |last| e.round <= last))
            .collect();
        events.sort_by_key(|e| e.key());
        Ok(events)
    }

    async fn extract(
        &self,
        entity: EntityKind,
        now: DateTime<Utc>,
    ) -> Result<(Option<i32>, Vec<Record>), SyncError> {
        let source = self.source.as_ref();
        let standings_season = self.explicit_season().unwrap_or_else(|| now.year());

        let (season, records) = match entity {
            EntityKind::Drivers => {
                let drivers = source.drivers(standings_season).await?;
                let standings = source.driver_standings(standings_season).await?;
                let records = driver_records(&drivers, &standings, &self.config.inactive_drivers);
                (Some(standings_season), records)
            }
            EntityKind::DriverStandings => {
                let standings = source.driver_standings(standings_season).await?;
                (Some(standings_season), driver_standing_records(&standings))
            }
            EntityKind::TeamStandings => {
                let standings = source.constructor_standings(standings_season).await?;
                (Some(standings_season), team_standing_records(&standings))
            }
            EntityKind::Events => {
                let (season, last_round) = self.race_window(now).await?;
                let mut records = Vec::new();
                for event in self.race_events(season, last_round).await? {
                    let results = if event.start <= now {
                        match source.race_results(season, event.round).await {
                            Ok(results) => results,
                            Err(err) => {
                                warn!(season, round = event.round, %err, "skipping event without results");
                                continue;
                            }
                        }
                    } else {
                        Vec::new()
                    };
                    records.push(event_record(&event, &results));
                }
                (Some(season), records)
            }
            EntityKind::RacePace => {
                let (season, last_round) = self.race_window(now).await?;
                let filter = self.config.lap_filter();
                let mut records = Vec::new();
                for event in self.race_events(season, last_round).await? {
                    if event.start > now {
                        continue;
                    }
                    let session = async {
                        let results = source.race_results(season, event.round).await?;
                        let laps = source.lap_timings(season, event.round).await?;
                        Ok::<_, AdapterError>((results, laps))
                    };
                    let (results, laps) = match session.await {
                        Ok(session) => session,
                        Err(err) => {
                            warn!(season, round = event.round, %err, "skipping round without lap data");
                            continue;
                        }
                    };
                    records.extend(race_pace_records(
                        season,
                        event.round,
                        &event.name,
                        &results,
                        &laps,
                        &filter,
                    ));
                }
                (Some(season), records)
            }
            EntityKind::UpcomingGp => match resolve_upcoming(source, now).await? {
                Upcoming::Scheduled(event) => (Some(event.season), vec![upcoming_gp_record(&event)]),
                Upcoming::Placeholder { season } => {
                    info!(season, "no upcoming event on the calendar; writing placeholder");
                    (Some(season), vec![upcoming_gp_placeholder(season)])
                }
            },
        };

        info!(entity = %entity, season, records = records.len(), "extracted records");
        Ok((season, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pitwall_core::Value;
    use std::collections::HashMap;
    use std::io::Write;

    fn fixtures_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/ergast")
    }

    fn config_with(season: Option<i32>) -> SyncConfig {
        let mut config = SyncConfig::from_vars(|_| None);
        config.fixtures_dir = Some(fixtures_dir());
        config.season = season;
        config.dry_run = true;
        config
    }

    fn pipeline(config: SyncConfig, store: MemoryStore) -> SyncPipeline {
        let source = ErgastProvider::new(FixtureTransport::new(fixtures_dir()));
        SyncPipeline::new(config, EntityRegistry::default(), Box::new(source), Box::new(store))
    }

    fn between_rounds_two_and_three() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 30, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn config_reads_variables_with_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MONGODB_URI", "mongodb://localhost:27017"),
            ("PITWALL_INACTIVE_DRIVERS", "doo, law"),
            ("PITWALL_SEASON", "2024"),
        ]);
        let config = SyncConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.database, DEFAULT_DATABASE);
        assert_eq!(config.season, Some(2024));
        assert_eq!(config.inactive_drivers, vec!["DOO", "LAW"]);
        assert_eq!(config.lookback_seasons, 1);
        let store = config.store_config().unwrap();
        assert_eq!(store.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn missing_store_address_is_a_configuration_error() {
        let config = SyncConfig::from_vars(|_| None);
        assert_eq!(config.inactive_drivers, vec!["DOO"]);
        assert!(matches!(
            config.store_config(),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn entity_kinds_parse_and_key() {
        assert_eq!("race-pace".parse::<EntityKind>(), Ok(EntityKind::RacePace));
        assert_eq!(EntityKind::UpcomingGp.identity_key(), "id");
        assert!("laps".parse::<EntityKind>().is_err());
    }

    #[test]
    fn registry_overrides_collections_and_disables_entities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(EntityRegistry::FILE_NAME);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "entities:\n  - entity: drivers\n    collection: drivers_v2\n  - entity: race_pace\n    enabled: false\n  - entity: events"
        )
        .unwrap();

        let registry = EntityRegistry::load(&path).unwrap();
        assert_eq!(registry.enabled(), vec![EntityKind::Drivers, EntityKind::Events]);
        assert_eq!(registry.collection_for(EntityKind::Drivers), "drivers_v2");
        assert_eq!(registry.collection_for(EntityKind::Events), "events");

        let missing = EntityRegistry::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(missing.enabled().len(), EntityKind::ALL.len());
    }

    #[tokio::test]
    async fn race_pace_is_ranked_per_round_up_to_latest_event() {
        let store = MemoryStore::new();
        let pipeline = pipeline(config_with(None), store.clone());

        let run = pipeline
            .run_entity(EntityKind::RacePace, between_rounds_two_and_three())
            .await
            .unwrap();
        assert_eq!(run.season, Some(2025));
        assert_eq!(run.report.created, 6);
        assert!(run.report.is_clean());

        let docs = store.documents("race_pace").await;
        let rank_of = |id: &str| {
            docs.iter()
                .find(|d| d.text("race_pace_id") == Some(id))
                .and_then(|d| d.int("race_pace_position"))
        };
        assert_eq!(rank_of("2025_1_NOR"), Some(1));
        assert_eq!(rank_of("2025_1_PIA"), Some(2));
        assert_eq!(rank_of("2025_1_VER"), Some(3));
        assert_eq!(rank_of("2025_2_PIA"), Some(1));
        assert_eq!(rank_of("2025_2_VER"), Some(3));
    }

    #[tokio::test]
    async fn events_stop_at_the_most_recent_round() {
        let store = MemoryStore::new();
        let pipeline = pipeline(config_with(None), store.clone());

        let run = pipeline
            .run_entity(EntityKind::Events, between_rounds_two_and_three())
            .await
            .unwrap();
        assert_eq!(run.report.created, 2);

        let shanghai = store
            .find_one("events", "event_id", &Value::from("2025_2_Chinese Grand Prix"))
            .await
            .unwrap();
        assert_eq!(shanghai.text("winner"), Some("PIA"));
        assert_eq!(shanghai.text("event_format"), Some("sprint"));
    }

    #[tokio::test]
    async fn explicit_season_lists_future_rounds_as_upcoming() {
        let store = MemoryStore::new();
        let pipeline = pipeline(config_with(Some(2025)), store.clone());

        let run = pipeline
            .run_entity(EntityKind::Events, between_rounds_two_and_three())
            .await
            .unwrap();
        assert_eq!(run.report.created, 3);
        let suzuka = store
            .find_one("events", "event_id", &Value::from("2025_3_Japanese Grand Prix"))
            .await
            .unwrap();
        assert_eq!(suzuka.text("event_status"), Some("upcoming"));
    }

    #[tokio::test]
    async fn rollover_resolves_previous_season() {
        let pipeline = pipeline(config_with(None), MemoryStore::new());
        let january = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).single().unwrap();

        let run = pipeline.run_entity(EntityKind::Events, january).await.unwrap();
        assert_eq!(run.season, Some(2024));
        // The fixture tree carries no 2024 results.
        assert_eq!(run.report.submitted, 0);
    }

    #[tokio::test]
    async fn upcoming_gp_is_the_next_weekend() {
        let store = MemoryStore::new();
        let pipeline = pipeline(config_with(None), store.clone());

        pipeline
            .run_entity(EntityKind::UpcomingGp, between_rounds_two_and_three())
            .await
            .unwrap();
        let docs = store.documents("upcoming_gp").await;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text("id"), Some("2025-3"));
        assert_eq!(docs[0].text("countryCode"), Some("JP"));
    }

    #[tokio::test]
    async fn unfetchable_calendar_fails_upcoming_gp_without_writing() {
        let store = MemoryStore::new();
        let pipeline = pipeline(config_with(None), store.clone());
        let mid_2023 = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).single().unwrap();

        let err = pipeline
            .run_entity(EntityKind::UpcomingGp, mid_2023)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Upstream(_)));
        assert!(!err.aborts_run());
        assert!(store.documents("upcoming_gp").await.is_empty());

        let summary = pipeline
            .run_entities(&[EntityKind::UpcomingGp], mid_2023)
            .await
            .unwrap();
        assert!(summary.runs.is_empty());
        assert_eq!(summary.failures[0].entity, EntityKind::UpcomingGp);
    }

    #[tokio::test]
    async fn rerunning_drivers_updates_in_place() {
        let store = MemoryStore::new();
        let pipeline = pipeline(config_with(None), store.clone());
        let first = between_rounds_two_and_three();

        let initial = pipeline.run_entity(EntityKind::Drivers, first).await.unwrap();
        assert_eq!(initial.report.created, 3);

        let later = first + chrono::Duration::hours(6);
        let rerun = pipeline.run_entity(EntityKind::Drivers, later).await.unwrap();
        assert_eq!(rerun.report.created, 0);
        assert_eq!(rerun.report.matched, 3);

        let ver = store
            .find_one("drivers", "driverCode", &Value::from("VER"))
            .await
            .unwrap();
        assert_eq!(ver.get("_created_at"), Some(&Value::Timestamp(first)));
        assert_eq!(ver.get("_updated_at"), Some(&Value::Timestamp(later)));
        assert!(store
            .find_one("drivers", "driverCode", &Value::from("DOO"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn unreachable_store_aborts_the_run() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let pipeline = pipeline(config_with(None), store);

        let err = pipeline
            .run_all(between_rounds_two_and_three())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Connectivity(_)));
    }

    #[tokio::test]
    async fn upstream_failures_are_recorded_per_entity() {
        // The 1950 override starves drivers; upcoming_gp ignores it and reads 2025.
        let pipeline = pipeline(config_with(Some(1950)), MemoryStore::new());

        let summary = pipeline
            .run_entities(
                &[EntityKind::Drivers, EntityKind::UpcomingGp],
                between_rounds_two_and_three(),
            )
            .await
            .unwrap();
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].entity, EntityKind::Drivers);
        assert_eq!(summary.runs.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_config_builds_without_a_store_address() {
        let pipeline = SyncPipeline::from_config(config_with(None)).await.unwrap();
        assert!(pipeline.registry().enabled().contains(&EntityKind::Drivers));

        let summary = pipeline
            .run_entities(&[EntityKind::TeamStandings], between_rounds_two_and_three())
            .await
            .unwrap();
        assert!(summary.source.starts_with("fixtures at"));
        assert_eq!(summary.store, "in-memory store");
    }

    #[tokio::test]
    async fn live_config_without_address_fails_before_fetching() {
        let mut config = config_with(None);
        config.dry_run = false;
        let err = SyncPipeline::from_config(config).await.err().unwrap();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
