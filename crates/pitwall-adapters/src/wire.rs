//! Ergast-compatible JSON payloads, consumed as the provider ships them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(rename = "MRData")]
    pub mr_data: MrData<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MrData<T> {
    #[serde(default)]
    pub total: Option<String>,
    #[serde(flatten)]
    pub table: T,
}

impl<T> MrData<T> {
    pub fn total(&self) -> u32 {
        self.total
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DriverTablePayload {
    #[serde(rename = "DriverTable")]
    pub driver_table: DriverTable,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DriverTable {
    #[serde(rename = "Drivers", default)]
    pub drivers: Vec<ErgastDriver>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StandingsTablePayload {
    #[serde(rename = "StandingsTable")]
    pub standings_table: StandingsTable,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StandingsTable {
    #[serde(rename = "StandingsLists", default)]
    pub lists: Vec<StandingsList>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StandingsList {
    #[serde(rename = "DriverStandings", default)]
    pub driver_standings: Vec<DriverStanding>,
    #[serde(rename = "ConstructorStandings", default)]
    pub constructor_standings: Vec<ConstructorStanding>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RaceTablePayload {
    #[serde(rename = "RaceTable")]
    pub race_table: RaceTable,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RaceTable {
    #[serde(rename = "Races", default)]
    pub races: Vec<ErgastRace>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErgastDriver {
    pub driver_id: String,
    #[serde(default)]
    pub permanent_number: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub given_name: String,
    pub family_name: String,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub nationality: Option<String>,
}

impl ErgastDriver {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.given_name, self.family_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErgastConstructor {
    pub constructor_id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub name: String,
    #[serde(default)]
    pub nationality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverStanding {
    #[serde(default)]
    pub position: Option<String>,
    pub points: String,
    #[serde(default)]
    pub wins: Option<String>,
    #[serde(rename = "Driver")]
    pub driver: ErgastDriver,
    #[serde(rename = "Constructors", default)]
    pub constructors: Vec<ErgastConstructor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructorStanding {
    #[serde(default)]
    pub position: Option<String>,
    pub points: String,
    #[serde(default)]
    pub wins: Option<String>,
    #[serde(rename = "Constructor")]
    pub constructor: ErgastConstructor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTime {
    pub date: String,
    #[serde(default)]
    pub time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErgastLocation {
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErgastCircuit {
    pub circuit_id: String,
    pub circuit_name: String,
    #[serde(rename = "Location", default)]
    pub location: Option<ErgastLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErgastRace {
    pub season: String,
    pub round: String,
    #[serde(rename = "raceName")]
    pub race_name: String,
    #[serde(rename = "Circuit")]
    pub circuit: ErgastCircuit,
    pub date: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(rename = "FirstPractice", default)]
    pub first_practice: Option<SessionTime>,
    #[serde(rename = "Sprint", default)]
    pub sprint: Option<SessionTime>,
    #[serde(rename = "Results", default)]
    pub results: Vec<ErgastResult>,
    #[serde(rename = "Laps", default)]
    pub laps: Vec<ErgastLap>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErgastResult {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub points: Option<String>,
    #[serde(default)]
    pub grid: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "Driver")]
    pub driver: ErgastDriver,
    #[serde(rename = "Constructor", default)]
    pub constructor: Option<ErgastConstructor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErgastLap {
    pub number: String,
    #[serde(rename = "Timings", default)]
    pub timings: Vec<LapTiming>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapTiming {
    #[serde(rename = "driverId")]
    pub driver_id: String,
    #[serde(default)]
    pub position: Option<String>,
    pub time: String,
}
