use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    astro::Site,
    cycle::{Applicability, Cycle, Trigger, MAX_FUZZ_MINUTES},
};

pub const MAX_CYCLES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("field `{field}` has invalid value `{value}`")]
    InvalidValue { field: String, value: String },
}

/// Read access to one submitted form. Absent fields are `None`.
pub trait FormFields {
    fn field(&self, name: &str) -> Option<&str>;
}

impl FormFields for HashMap<String, String> {
    fn field(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub enabled: bool,
    pub site: Site,
    pub cycles: Vec<Cycle>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            enabled: false,
            site: Site::default(),
            cycles: vec![Cycle::default(); MAX_CYCLES],
        }
    }
}

impl Schedule {
    pub fn normalize(&mut self) {
        self.site.sanitize();
        self.cycles.truncate(MAX_CYCLES);
        self.cycles.resize(MAX_CYCLES, Cycle::default());
        for cycle in &mut self.cycles {
            cycle.sanitize();
        }
    }

    /// Overlay one form submission.
    ///
    /// Checkboxes are only sent when ticked, so every enable flag is cleared
    /// first and set again only if its field is present. The update is
    /// all-or-nothing: on error `self` is left untouched.
    pub fn apply_form(&mut self, form: &impl FormFields) -> Result<(), FormError> {
        let mut next = self.clone();
        next.enabled = form.field("enabled").is_some();
        for cycle in &mut next.cycles {
            cycle.enabled = false;
        }

        if let Some(value) = form.field("lat") {
            next.site.latitude_deg = parse_field("lat", value, -90.0..=90.0)?;
        }
        if let Some(value) = form.field("lon") {
            next.site.longitude_deg = parse_field("lon", value, -180.0..=180.0)?;
        }
        if let Some(value) = form.field("elev") {
            next.site.elevation_m = parse_field("elev", value, 0.0..=9_000.0)?;
        }

        for (index, cycle) in next.cycles.iter_mut().enumerate() {
            let name = |suffix: &str| format!("c{index}_{suffix}");

            cycle.enabled = form.field(&name("enabled")).is_some();

            let days = name("days");
            if let Some(value) = form.field(&days) {
                cycle.applicability = value
                    .parse::<Applicability>()
                    .map_err(|_| invalid(&days, value))?;
            }

            let on = name("on");
            if let Some(value) = form.field(&on) {
                cycle.on = value.parse::<Trigger>().map_err(|_| invalid(&on, value))?;
            }

            let off = name("off");
            if let Some(value) = form.field(&off) {
                cycle.off = value.parse::<Trigger>().map_err(|_| invalid(&off, value))?;
            }

            let fuzz = name("fuzz");
            if let Some(value) = form.field(&fuzz) {
                cycle.fuzz_minutes = match value.trim() {
                    "" => 0,
                    text => text
                        .parse::<u16>()
                        .ok()
                        .filter(|minutes| *minutes <= MAX_FUZZ_MINUTES)
                        .ok_or_else(|| invalid(&fuzz, value))?,
                };
            }
        }

        next.normalize();
        *self = next;
        Ok(())
    }
}

fn parse_field(
    field: &str,
    value: &str,
    range: std::ops::RangeInclusive<f64>,
) -> Result<f64, FormError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|parsed| range.contains(parsed))
        .ok_or_else(|| invalid(field, value))
}

fn invalid(field: &str, value: &str) -> FormError {
    FormError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}

/// Owner of the live schedule.
///
/// Every mutation goes through here and raises the dirty flag, which the
/// follower consumes to re-resolve its triggers.
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    schedule: Schedule,
    dirty: bool,
}

impl ScheduleStore {
    pub fn new(mut schedule: Schedule) -> Self {
        schedule.normalize();
        Self {
            schedule,
            dirty: true,
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn update<T>(&mut self, edit: impl FnOnce(&mut Schedule) -> T) -> T {
        let result = edit(&mut self.schedule);
        self.schedule.normalize();
        self.mark_dirty();
        result
    }

    pub fn replace(&mut self, schedule: Schedule) {
        self.update(|active| *active = schedule);
    }

    pub fn apply_form(&mut self, form: &impl FormFields) -> Result<(), FormError> {
        let mut next = self.schedule.clone();
        next.apply_form(form)?;
        self.replace(next);
        Ok(())
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Return the dirty flag and clear it.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

impl Default for ScheduleStore {
    fn default() -> Self {
        Self::new(Schedule::default())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cycle::SunEvent;

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn normalize_pads_and_truncates_cycles() {
        let mut schedule = Schedule {
            cycles: vec![Cycle::default(); 2],
            ..Schedule::default()
        };
        schedule.normalize();
        assert_eq!(schedule.cycles.len(), MAX_CYCLES);

        schedule.cycles.extend([Cycle::default(); 3]);
        schedule.normalize();
        assert_eq!(schedule.cycles.len(), MAX_CYCLES);
    }

    #[test]
    fn form_overlays_present_fields() {
        let mut schedule = Schedule::default();
        schedule
            .apply_form(&form(&[
                ("enabled", "on"),
                ("lat", "47.61"),
                ("c0_enabled", "on"),
                ("c0_days", "weekday"),
                ("c0_on", "08:00"),
                ("c0_off", "sunset-30"),
                ("c0_fuzz", "10"),
            ]))
            .unwrap();

        assert!(schedule.enabled);
        assert_eq!(schedule.site.latitude_deg, 47.61);
        assert_eq!(schedule.site.longitude_deg, Site::default().longitude_deg);
        assert_eq!(
            schedule.cycles[0],
            Cycle {
                enabled: true,
                applicability: Applicability::Weekday,
                on: Trigger::Clock { minute: 480 },
                off: Trigger::Sun {
                    event: SunEvent::Sunset,
                    offset_minutes: -30,
                },
                fuzz_minutes: 10,
            }
        );
    }

    #[test]
    fn missing_checkboxes_disable() {
        let mut schedule = Schedule::default();
        schedule.enabled = true;
        schedule.cycles[2].enabled = true;
        schedule.cycles[2].on = Trigger::Clock { minute: 60 };

        schedule
            .apply_form(&form(&[("c2_on", "02:00")]))
            .unwrap();

        assert!(!schedule.enabled);
        assert!(!schedule.cycles[2].enabled);
        assert_eq!(schedule.cycles[2].on, Trigger::Clock { minute: 120 });
    }

    #[test]
    fn invalid_field_leaves_schedule_unchanged() {
        let mut schedule = Schedule::default();
        schedule.enabled = true;
        let before = schedule.clone();

        let err = schedule
            .apply_form(&form(&[("c1_on", "25:00"), ("enabled", "on")]))
            .unwrap_err();

        assert_eq!(
            err,
            FormError::InvalidValue {
                field: "c1_on".to_string(),
                value: "25:00".to_string(),
            }
        );
        assert_eq!(schedule, before);
    }

    #[test]
    fn rejects_out_of_range_numbers() {
        let mut schedule = Schedule::default();
        assert!(schedule.apply_form(&form(&[("lat", "91")])).is_err());
        assert!(schedule.apply_form(&form(&[("c0_fuzz", "500")])).is_err());
        assert!(schedule.apply_form(&form(&[("c0_days", "monday")])).is_err());
    }

    #[test]
    fn store_marks_dirty_on_every_edit() {
        let mut store = ScheduleStore::default();
        assert!(store.take_dirty());
        assert!(!store.take_dirty());

        store.update(|schedule| schedule.enabled = true);
        assert!(store.is_dirty());
        assert!(store.take_dirty());

        assert!(store.apply_form(&form(&[("lat", "bogus")])).is_err());
        assert!(!store.is_dirty());

        store.apply_form(&form(&[("enabled", "on")])).unwrap();
        assert!(store.take_dirty());
        assert!(store.schedule().enabled);
    }
}
