//! Schedule follower.
//!
//! Called on every pass of the control loop. Work only happens when the
//! local minute changes or the schedule was edited:
//!
//! 1. *Recompute* after an edit (or the first valid clock reading): refresh
//!    today's sun times, resolve every cycle's on/off minute and draw fuzz.
//!    Edges already behind the clock are deferred to tomorrow (`+1440`).
//! 2. *Roll over* when the local date changes: refresh sun times and fold
//!    deferred edges back into the new day, keeping their drawn fuzz. A
//!    change of UTC offset within the day (DST) re-resolves the same way
//!    but leaves fired and passed edges deferred.
//! 3. *Evaluate* once per minute: fire each applicable edge whose resolved
//!    minute equals the clock.
//!
//! Fuzz belongs to one on/off occurrence. When the on edge fires, the off
//! edge that closes it takes the same offset and the on edge draws a fresh
//! one for tomorrow. Fuzz never moves an edge across midnight, so an
//! occurrence keeps its order even when the cycle spans midnight.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike, Weekday};
use log::{info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;

use crate::{
    astro::{Site, SunCalculator, SunMinutes},
    cycle::{format_clock_time, Cycle, MINUTES_PER_DAY},
    outlet::Outlet,
    schedule::{Schedule, ScheduleStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub cycle: usize,
    pub edge: Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Recompute,
    Evaluate,
}

/// What one call to [`ScheduleFollower::tick`] did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TickOutcome {
    /// Furthest phase reached.
    pub phase: Phase,
    pub recomputed: bool,
    pub fired: Vec<Transition>,
}

/// One edge's effective minute. Values in `1440..2880` are deferred to
/// tomorrow and cannot match today's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedEdge {
    pub minute: u16,
    pub fuzz: i16,
}

impl ResolvedEdge {
    /// `base` shifted by `fuzz`, held inside today.
    fn new(base: u16, fuzz: i16) -> Self {
        let last = i32::from(MINUTES_PER_DAY) - 1;
        let minute = (i32::from(base) + i32::from(fuzz)).clamp(0, last) as u16;
        Self { minute, fuzz }
    }

    fn tomorrow(self) -> Self {
        Self {
            minute: self.minute_of_day() + MINUTES_PER_DAY,
            ..self
        }
    }

    fn not_before(self, minute: u16) -> Self {
        if self.minute < minute {
            self.tomorrow()
        } else {
            self
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.minute >= MINUTES_PER_DAY
    }

    pub fn minute_of_day(&self) -> u16 {
        self.minute % MINUTES_PER_DAY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ResolvedCycle {
    /// Never fires today: on and off coincide or a sun time is missing.
    Inert,
    Active {
        #[serde(skip)]
        on_base: u16,
        #[serde(skip)]
        off_base: u16,
        on: ResolvedEdge,
        off: ResolvedEdge,
        /// The on edge fired and its off edge has not yet. The off edge
        /// fires even on a day the cycle does not apply to.
        armed: bool,
    },
}

pub struct ScheduleFollower {
    sun: SunCalculator,
    rng: StdRng,
    resolved: Vec<ResolvedCycle>,
    sun_today: Option<SunMinutes>,
    day: Option<NaiveDate>,
    offset: Option<FixedOffset>,
    last_evaluated: Option<(NaiveDate, u16)>,
    needs_recompute: bool,
}

impl ScheduleFollower {
    pub fn new(site: Site) -> Self {
        Self::with_rng(site, StdRng::from_entropy())
    }

    /// Deterministic fuzz, for tests and simulations.
    pub fn with_seed(site: Site, seed: u64) -> Self {
        Self::with_rng(site, StdRng::seed_from_u64(seed))
    }

    fn with_rng(site: Site, rng: StdRng) -> Self {
        Self {
            sun: SunCalculator::new(site),
            rng,
            resolved: Vec::new(),
            sun_today: None,
            day: None,
            offset: None,
            last_evaluated: None,
            needs_recompute: true,
        }
    }

    pub fn resolved(&self) -> &[ResolvedCycle] {
        &self.resolved
    }

    pub fn sun_minutes(&self) -> Option<SunMinutes> {
        self.sun_today
    }

    /// Advance the follower to `now`.
    ///
    /// `now` is `None` while the wall clock is not trustworthy; the tick is
    /// then a no-op, as it is when the schedule is disabled. The store's
    /// dirty flag is consumed either way and remembered until the next
    /// tick that can act on it.
    pub fn tick(
        &mut self,
        store: &mut ScheduleStore,
        now: Option<DateTime<FixedOffset>>,
        outlet: &mut (impl Outlet + ?Sized),
    ) -> TickOutcome {
        if store.take_dirty() {
            self.needs_recompute = true;
        }

        let Some(now) = now else {
            return TickOutcome::default();
        };
        let schedule = store.schedule();
        if !schedule.enabled {
            return TickOutcome::default();
        }

        let today = now.date_naive();
        let offset = *now.offset();
        let minute = (now.hour() * 60 + now.minute()) as u16;
        let minute_changed = self.last_evaluated != Some((today, minute));
        if !self.needs_recompute && !minute_changed && self.offset == Some(offset) {
            return TickOutcome::default();
        }

        let mut outcome = TickOutcome::default();

        if self.needs_recompute {
            self.recompute(schedule, &offset, today, minute);
            self.needs_recompute = false;
            outcome.recomputed = true;
            outcome.phase = Phase::Recompute;
        } else if self.day != Some(today) {
            self.resolve_keeping_fuzz(schedule, &offset, today, None);
            info!("schedule rolled over to {today}");
            outcome.recomputed = true;
            outcome.phase = Phase::Recompute;
        } else if self.offset != Some(offset) {
            self.resolve_keeping_fuzz(schedule, &offset, today, Some(minute));
            info!("UTC offset is now {offset}, schedule re-resolved");
            outcome.recomputed = true;
            outcome.phase = Phase::Recompute;
        }

        if minute_changed {
            self.last_evaluated = Some((today, minute));
            outcome.fired = self.evaluate(schedule, now.weekday(), minute, outlet);
            outcome.phase = Phase::Evaluate;
        }

        outcome
    }

    fn refresh_sun(&mut self, schedule: &Schedule, offset: &FixedOffset, today: NaiveDate) {
        self.sun.set_site(schedule.site);
        self.sun_today = match self.sun.sun_times(today, offset) {
            Ok(times) => Some(times.local_minutes(offset)),
            Err(err) => {
                if schedule.cycles.iter().any(|c| c.enabled && c.uses_sun()) {
                    warn!("sun-relative cycles inert on {today}: {err}");
                }
                None
            }
        };
        self.day = Some(today);
        self.offset = Some(*offset);
    }

    fn recompute(
        &mut self,
        schedule: &Schedule,
        offset: &FixedOffset,
        today: NaiveDate,
        minute: u16,
    ) {
        self.refresh_sun(schedule, offset, today);

        let sun = self.sun_today;
        let previous = std::mem::take(&mut self.resolved);
        let mut resolved = Vec::with_capacity(schedule.cycles.len());
        for (index, cycle) in schedule.cycles.iter().enumerate() {
            let entry = match base_minutes(cycle, sun.as_ref()) {
                Some((on_base, off_base)) => {
                    let fuzz = draw_fuzz(&mut self.rng, cycle.fuzz_minutes);
                    ResolvedCycle::Active {
                        on_base,
                        off_base,
                        on: ResolvedEdge::new(on_base, fuzz).not_before(minute),
                        off: ResolvedEdge::new(off_base, fuzz).not_before(minute),
                        armed: matches!(
                            previous.get(index),
                            Some(ResolvedCycle::Active { armed: true, .. })
                        ),
                    }
                }
                None => ResolvedCycle::Inert,
            };
            resolved.push(entry);
        }
        self.resolved = resolved;

        match sun {
            Some(sun) => info!(
                "schedule resolved for {today}: sunrise {}, sunset {}",
                format_clock_time(sun.sunrise),
                format_clock_time(sun.sunset)
            ),
            None => info!("schedule resolved for {today} without sun times"),
        }
    }

    /// Resolve against fresh sun times, keeping each cycle's drawn fuzz.
    ///
    /// With `now_minute` unset (a new day) every edge is folded back into
    /// today. With it set, deferred edges stay deferred and edges that now
    /// fall behind the clock are deferred.
    fn resolve_keeping_fuzz(
        &mut self,
        schedule: &Schedule,
        offset: &FixedOffset,
        today: NaiveDate,
        now_minute: Option<u16>,
    ) {
        self.refresh_sun(schedule, offset, today);

        let sun = self.sun_today;
        let previous = std::mem::take(&mut self.resolved);
        let mut resolved = Vec::with_capacity(schedule.cycles.len());
        for (index, cycle) in schedule.cycles.iter().enumerate() {
            let Some((on_base, off_base)) = base_minutes(cycle, sun.as_ref()) else {
                resolved.push(ResolvedCycle::Inert);
                continue;
            };

            let place = |edge: ResolvedEdge, was_deferred: bool| match now_minute {
                None => edge,
                Some(_) if was_deferred => edge.tomorrow(),
                Some(minute) => edge.not_before(minute),
            };

            let entry = match previous.get(index) {
                Some(&ResolvedCycle::Active { on, off, armed, .. }) => ResolvedCycle::Active {
                    on_base,
                    off_base,
                    on: place(ResolvedEdge::new(on_base, on.fuzz), on.is_deferred()),
                    off: place(ResolvedEdge::new(off_base, off.fuzz), off.is_deferred()),
                    armed,
                },
                // Inert before (e.g. no sunrise); draw fresh fuzz now that
                // it resolves again.
                _ => {
                    let fuzz = draw_fuzz(&mut self.rng, cycle.fuzz_minutes);
                    ResolvedCycle::Active {
                        on_base,
                        off_base,
                        on: place(ResolvedEdge::new(on_base, fuzz), false),
                        off: place(ResolvedEdge::new(off_base, fuzz), false),
                        armed: false,
                    }
                }
            };
            resolved.push(entry);
        }
        self.resolved = resolved;
    }

    fn evaluate(
        &mut self,
        schedule: &Schedule,
        weekday: Weekday,
        minute: u16,
        outlet: &mut (impl Outlet + ?Sized),
    ) -> Vec<Transition> {
        let mut fired = Vec::new();

        for (index, cycle) in schedule.cycles.iter().enumerate() {
            if !cycle.enabled {
                continue;
            }
            let Some(ResolvedCycle::Active {
                on_base,
                off_base,
                mut on,
                mut off,
                mut armed,
            }) = self.resolved.get(index).copied()
            else {
                continue;
            };
            let applies = cycle.applicability.applies_on(weekday);

            if applies && on.minute == minute {
                outlet.set_outlet(true);
                info!("cycle {index}: outlet on");
                fired.push(Transition {
                    cycle: index,
                    edge: Edge::On,
                });
                armed = true;
                off = ResolvedEdge::new(off_base, on.fuzz).not_before(minute);
                let fuzz = draw_fuzz(&mut self.rng, cycle.fuzz_minutes);
                on = ResolvedEdge::new(on_base, fuzz).tomorrow();
            }

            if (applies || armed) && off.minute == minute {
                outlet.set_outlet(false);
                info!("cycle {index}: outlet off");
                fired.push(Transition {
                    cycle: index,
                    edge: Edge::Off,
                });
                armed = false;
                off = ResolvedEdge::new(off_base, on.fuzz).tomorrow();
            }

            self.resolved[index] = ResolvedCycle::Active {
                on_base,
                off_base,
                on,
                off,
                armed,
            };
        }

        fired
    }
}

fn draw_fuzz(rng: &mut StdRng, fuzz_minutes: u16) -> i16 {
    if fuzz_minutes == 0 {
        return 0;
    }
    let width = fuzz_minutes as i16;
    rng.gen_range(-width..=width)
}

/// Today's on/off minutes before fuzz, or `None` when the cycle cannot
/// fire today.
fn base_minutes(cycle: &Cycle, sun: Option<&SunMinutes>) -> Option<(u16, u16)> {
    let on = cycle.on.base_minute(sun)?;
    let off = cycle.off.base_minute(sun)?;
    (on != off).then_some((on, off))
}
