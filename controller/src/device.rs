use chrono::{DateTime, Datelike, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use outlet_common::{
    cycle::format_clock_time,
    outlet, persist, AstroError, CycleStatus, FormError, FormFields, Outlet, OutletStatus,
    RuntimeConfig, Schedule, ScheduleFollower, ScheduleStore, SunCalculator, SunMinutes,
    TickOutcome,
};

/// Clocks reading earlier than this have not been set by SNTP yet.
const EARLIEST_PLAUSIBLE_YEAR: i32 = 2023;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
}

/// Everything the control loop, console and web handlers share.
pub struct Device {
    store: ScheduleStore,
    follower: ScheduleFollower,
    /// For console queries; the follower keeps its own.
    sun: SunCalculator,
    outlet: Box<dyn Outlet + Send>,
    runtime: RuntimeConfig,
    time_synced: bool,
}

impl Device {
    pub fn new(runtime: RuntimeConfig, schedule: Schedule, outlet: Box<dyn Outlet + Send>) -> Self {
        let follower = ScheduleFollower::new(schedule.site);
        Self::with_follower(runtime, schedule, outlet, follower)
    }

    pub fn with_follower(
        runtime: RuntimeConfig,
        schedule: Schedule,
        outlet: Box<dyn Outlet + Send>,
        follower: ScheduleFollower,
    ) -> Self {
        Self {
            sun: SunCalculator::new(schedule.site),
            store: ScheduleStore::new(schedule),
            follower,
            outlet,
            runtime,
            time_synced: false,
        }
    }

    pub fn tick(&mut self, now: Option<DateTime<FixedOffset>>) -> TickOutcome {
        self.follower
            .tick(&mut self.store, now, self.outlet.as_mut())
    }

    /// Local wall-clock time, or `None` until the clock is trustworthy.
    pub fn now(&self) -> Option<DateTime<FixedOffset>> {
        wall_clock(&self.runtime.timezone, self.time_synced, Utc::now())
    }

    pub fn set_time_synced(&mut self, synced: bool) {
        self.time_synced = synced;
    }

    pub fn is_time_synced(&self) -> bool {
        self.time_synced
    }

    pub fn is_outlet_on(&self) -> bool {
        self.outlet.is_outlet_on()
    }

    pub fn set_outlet(&mut self, on: bool) {
        self.outlet.set_outlet(on);
    }

    pub fn toggle(&mut self) -> bool {
        outlet::toggle(self.outlet.as_mut())
    }

    pub fn schedule(&self) -> &Schedule {
        self.store.schedule()
    }

    pub fn update_schedule<T>(&mut self, edit: impl FnOnce(&mut Schedule) -> T) -> T {
        self.store.update(edit)
    }

    pub fn apply_form(&mut self, form: &impl FormFields) -> Result<(), FormError> {
        self.store.apply_form(form)
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut RuntimeConfig {
        &mut self.runtime
    }

    pub fn set_timezone(&mut self, timezone: &str) -> Result<(), DeviceError> {
        let timezone = timezone.trim();
        if timezone.parse::<Tz>().is_err() {
            return Err(DeviceError::UnknownTimezone(timezone.to_string()));
        }
        self.runtime.timezone = timezone.to_string();
        // Sun-relative minutes depend on the UTC offset.
        self.store.mark_dirty();
        Ok(())
    }

    /// Today's sun times at the scheduled site.
    pub fn sun_today(&mut self, now: DateTime<FixedOffset>) -> Result<SunMinutes, AstroError> {
        self.sun.set_site(self.store.schedule().site);
        self.sun
            .sun_times(now.date_naive(), now.offset())
            .map(|times| times.local_minutes(now.offset()))
    }

    pub fn schedule_blob(&self) -> Result<Vec<u8>, persist::PersistError> {
        persist::encode(self.store.schedule())
    }

    pub fn status(&self, now: Option<DateTime<FixedOffset>>) -> OutletStatus {
        let schedule = self.store.schedule();
        let resolved = self.follower.resolved();
        let cycles = schedule
            .cycles
            .iter()
            .enumerate()
            .map(|(index, cycle)| CycleStatus {
                index,
                enabled: cycle.enabled,
                days: cycle.applicability.as_str(),
                on: cycle.on.to_string(),
                off: cycle.off.to_string(),
                fuzz_minutes: cycle.fuzz_minutes,
                resolved: resolved.get(index).copied(),
            })
            .collect();

        OutletStatus {
            outlet_on: self.outlet.is_outlet_on(),
            schedule_enabled: schedule.enabled,
            time_synced: now.is_some(),
            timezone: self.runtime.timezone.clone(),
            local_time: now.map(|now| now.format("%Y-%m-%d %H:%M:%S %:z").to_string()),
            sun: self.follower.sun_minutes(),
            cycles,
        }
    }
}

/// Convert `utc` into `timezone`, refusing clocks that were never set.
pub fn wall_clock(
    timezone: &str,
    synced: bool,
    utc: DateTime<Utc>,
) -> Option<DateTime<FixedOffset>> {
    if !synced || utc.year() < EARLIEST_PLAUSIBLE_YEAR {
        return None;
    }
    let tz: Tz = timezone.parse().ok()?;
    let local = utc.with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

pub fn describe_sun(sun: &SunMinutes) -> String {
    format!(
        "Sunrise {}, solar noon {}, sunset {}",
        format_clock_time(sun.sunrise),
        format_clock_time(sun.solar_noon),
        format_clock_time(sun.sunset)
    )
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};
    use outlet_common::{RecordingOutlet, Site};
    use pretty_assertions::assert_eq;

    use super::*;

    fn device() -> Device {
        Device::with_follower(
            RuntimeConfig::default(),
            Schedule::default(),
            Box::new(RecordingOutlet::default()),
            ScheduleFollower::with_seed(Site::default(), 11),
        )
    }

    #[test]
    fn wall_clock_requires_sync_and_plausible_year() {
        let utc = Utc.with_ymd_and_hms(2026, 7, 1, 19, 30, 0).unwrap();
        assert_eq!(wall_clock("America/Los_Angeles", false, utc), None);
        assert_eq!(wall_clock("Mars/Olympus", true, utc), None);

        let stale = Utc.with_ymd_and_hms(1970, 1, 1, 0, 5, 0).unwrap();
        assert_eq!(wall_clock("UTC", true, stale), None);

        let local = wall_clock("America/Los_Angeles", true, utc).unwrap();
        assert_eq!(local.hour(), 12);
        assert_eq!(local.offset().local_minus_utc(), -7 * 3600);
    }

    #[test]
    fn timezone_change_is_validated_and_forces_recompute() {
        let mut device = device();
        let now = wall_clock("UTC", true, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        device.update_schedule(|schedule| schedule.enabled = true);
        assert!(device.tick(now).recomputed);
        assert!(!device.tick(now).recomputed);

        assert!(matches!(
            device.set_timezone("Nowhere/Special"),
            Err(DeviceError::UnknownTimezone(_))
        ));
        device.set_timezone("Europe/Berlin").unwrap();
        assert_eq!(device.runtime().timezone, "Europe/Berlin");
        assert!(device.tick(now).recomputed);
    }

    #[test]
    fn status_reports_outlet_and_cycles() {
        let mut device = device();
        device.set_outlet(true);
        assert!(!device.toggle());
        assert!(device.toggle());

        let status = device.status(None);
        assert!(status.outlet_on);
        assert!(!status.time_synced);
        assert_eq!(status.local_time, None);
        assert_eq!(status.cycles.len(), 8);
        assert_eq!(status.cycles[3].on, "00:00");
        assert_eq!(status.cycles[3].resolved, None);
    }

    #[test]
    fn sun_today_follows_the_scheduled_site() {
        let mut device = device();
        let utc = Utc.with_ymd_and_hms(2026, 1, 5, 20, 0, 0).unwrap();
        let now = wall_clock("America/Los_Angeles", true, utc).unwrap();

        let sun = device.sun_today(now).unwrap();
        assert!(sun.sunrise < sun.solar_noon && sun.solar_noon < sun.sunset);

        device.update_schedule(|schedule| schedule.site.latitude_deg = 78.22);
        assert!(matches!(
            device.sun_today(now),
            Err(AstroError::PolarNight { .. })
        ));
    }

    #[test]
    fn schedule_blob_decodes_back() {
        let mut device = device();
        device.update_schedule(|schedule| {
            schedule.enabled = true;
            schedule.cycles[1].fuzz_minutes = 30;
        });

        let blob = device.schedule_blob().unwrap();
        assert_eq!(&persist::decode(&blob).unwrap(), device.schedule());
    }
}
