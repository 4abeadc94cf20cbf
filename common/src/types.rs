use serde::Serialize;

use crate::{astro::SunMinutes, follower::ResolvedCycle};

#[derive(Debug, Clone, Serialize)]
pub struct CycleStatus {
    pub index: usize,
    pub enabled: bool,
    pub days: &'static str,
    pub on: String,
    pub off: String,
    #[serde(rename = "fuzzMinutes")]
    pub fuzz_minutes: u16,
    /// Minutes the follower will fire at, when it has resolved today.
    pub resolved: Option<ResolvedCycle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutletStatus {
    #[serde(rename = "outletOn")]
    pub outlet_on: bool,
    #[serde(rename = "scheduleEnabled")]
    pub schedule_enabled: bool,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
    #[serde(rename = "localTime")]
    pub local_time: Option<String>,
    pub sun: Option<SunMinutes>,
    pub cycles: Vec<CycleStatus>,
}
