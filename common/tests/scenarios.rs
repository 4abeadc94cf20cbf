//! Day-long runs of the follower against a recording relay.

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Timelike};
use outlet_common::{
    cycle::{Applicability, Cycle, SunEvent, Trigger},
    Edge, Outlet, RecordingOutlet, Schedule, ScheduleFollower, ScheduleStore, Site, SunMinutes,
    Transition,
};
use pretty_assertions::assert_eq;

fn pacific() -> FixedOffset {
    FixedOffset::west_opt(8 * 3600).unwrap()
}

/// Monday, Jan 5 2026, local midnight.
fn monday() -> DateTime<FixedOffset> {
    pacific().with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap()
}

fn minute_of_day(at: DateTime<FixedOffset>) -> u16 {
    (at.hour() * 60 + at.minute()) as u16
}

/// Tick once per minute for `minutes` minutes, returning every transition
/// with the minute it fired at.
fn run(
    follower: &mut ScheduleFollower,
    store: &mut ScheduleStore,
    outlet: &mut RecordingOutlet,
    start: DateTime<FixedOffset>,
    minutes: i64,
) -> Vec<(u16, Transition)> {
    let mut fired = Vec::new();
    for step in 0..minutes {
        let now = start + Duration::minutes(step);
        let outcome = follower.tick(store, Some(now), outlet);
        fired.extend(outcome.fired.into_iter().map(|t| (minute_of_day(now), t)));
    }
    fired
}

fn daily(on: Trigger, off: Trigger) -> Cycle {
    Cycle {
        enabled: true,
        applicability: Applicability::Daily,
        on,
        off,
        fuzz_minutes: 0,
    }
}

fn on(cycle: usize) -> Transition {
    Transition {
        cycle,
        edge: Edge::On,
    }
}

fn off(cycle: usize) -> Transition {
    Transition {
        cycle,
        edge: Edge::Off,
    }
}

#[test]
fn fixed_clock_cycle_fires_once_at_each_edge() {
    let mut schedule = Schedule::default();
    schedule.enabled = true;
    schedule.cycles[0] = daily(
        Trigger::Clock { minute: 480 },
        Trigger::Clock { minute: 780 },
    );
    let mut store = ScheduleStore::new(schedule);
    let mut follower = ScheduleFollower::with_seed(Site::default(), 3);
    let mut outlet = RecordingOutlet::default();

    let fired = run(&mut follower, &mut store, &mut outlet, monday(), 1440);

    assert_eq!(fired, vec![(480, on(0)), (780, off(0))]);
    assert_eq!(outlet.writes(), &[true, false]);
}

#[test]
fn sunrise_trigger_resolves_to_sunrise_minute() {
    let sun = SunMinutes {
        sunrise: 384,
        solar_noon: 732,
        sunset: 1080,
    };
    let trigger = Trigger::Sun {
        event: SunEvent::Sunrise,
        offset_minutes: 0,
    };
    assert_eq!(trigger.base_minute(Some(&sun)), Some(384));

    let mut schedule = Schedule::default();
    schedule.enabled = true;
    schedule.cycles[0] = daily(Trigger::Clock { minute: 0 }, trigger);
    let mut store = ScheduleStore::new(schedule);
    let mut follower = ScheduleFollower::with_seed(Site::default(), 3);
    let mut outlet = RecordingOutlet::default();

    let fired = run(&mut follower, &mut store, &mut outlet, monday(), 1440);
    let sunrise = follower.sun_minutes().unwrap().sunrise;

    assert_eq!(fired, vec![(0, on(0)), (sunrise, off(0))]);
}

#[test]
fn sunset_offsets_are_signed() {
    let mut schedule = Schedule::default();
    schedule.enabled = true;
    schedule.cycles[0] = daily(
        "sunset-45".parse().unwrap(),
        "sunrise+30".parse().unwrap(),
    );
    let mut store = ScheduleStore::new(schedule);
    let mut follower = ScheduleFollower::with_seed(Site::default(), 3);
    let mut outlet = RecordingOutlet::default();

    let fired = run(&mut follower, &mut store, &mut outlet, monday(), 1440);
    let sun = follower.sun_minutes().unwrap();

    assert_eq!(
        fired,
        vec![(sun.sunrise + 30, off(0)), (sun.sunset - 45, on(0))]
    );
}

#[test]
fn disabled_schedule_never_touches_the_relay() {
    let mut schedule = Schedule::default();
    schedule.enabled = false;
    for (index, cycle) in schedule.cycles.iter_mut().enumerate() {
        let minute = index as u16 * 100;
        *cycle = daily(
            Trigger::Clock { minute },
            Trigger::Clock { minute: minute + 50 },
        );
    }
    let mut store = ScheduleStore::new(schedule);
    let mut follower = ScheduleFollower::with_seed(Site::default(), 3);
    let mut outlet = RecordingOutlet::default();

    let fired = run(&mut follower, &mut store, &mut outlet, monday(), 3 * 1440);

    assert!(fired.is_empty());
    assert!(outlet.writes().is_empty());
}

#[test]
fn mid_day_edit_takes_effect_the_same_day() {
    let mut schedule = Schedule::default();
    schedule.enabled = true;
    schedule.cycles[0] = daily(
        Trigger::Clock { minute: 480 },
        Trigger::Clock { minute: 780 },
    );
    let mut store = ScheduleStore::new(schedule);
    let mut follower = ScheduleFollower::with_seed(Site::default(), 3);
    let mut outlet = RecordingOutlet::default();

    let morning = run(&mut follower, &mut store, &mut outlet, monday(), 600);
    assert_eq!(morning, vec![(480, on(0))]);

    store.update(|schedule| {
        schedule.cycles[0].off = Trigger::Clock { minute: 700 };
        schedule.cycles[1] = daily(
            Trigger::Clock { minute: 650 },
            Trigger::Clock { minute: 660 },
        );
    });

    let rest = run(
        &mut follower,
        &mut store,
        &mut outlet,
        monday() + Duration::minutes(600),
        840,
    );
    assert_eq!(rest, vec![(650, on(1)), (660, off(1)), (700, off(0))]);
}

#[test]
fn cycle_spanning_midnight_turns_off_next_morning() {
    let mut schedule = Schedule::default();
    schedule.enabled = true;
    schedule.cycles[0] = daily(
        Trigger::Clock { minute: 22 * 60 },
        Trigger::Clock { minute: 6 * 60 },
    );
    let mut store = ScheduleStore::new(schedule);
    let mut follower = ScheduleFollower::with_seed(Site::default(), 3);
    let mut outlet = RecordingOutlet::default();

    let start = monday() + Duration::hours(12);
    let fired = run(&mut follower, &mut store, &mut outlet, start, 1440);

    assert_eq!(fired, vec![(22 * 60, on(0)), (6 * 60, off(0))]);
    assert!(!outlet.is_outlet_on());
}

#[test]
fn boot_after_an_edge_waits_for_tomorrow() {
    let mut schedule = Schedule::default();
    schedule.enabled = true;
    schedule.cycles[0] = daily(
        Trigger::Clock { minute: 480 },
        Trigger::Clock { minute: 780 },
    );
    let mut store = ScheduleStore::new(schedule);
    let mut follower = ScheduleFollower::with_seed(Site::default(), 3);
    let mut outlet = RecordingOutlet::default();

    let start = monday() + Duration::hours(10);
    let fired = run(&mut follower, &mut store, &mut outlet, start, 1440);

    assert_eq!(fired, vec![(780, off(0)), (480, on(0))]);
}

#[test]
fn clock_becoming_valid_late_still_recomputes() {
    let mut schedule = Schedule::default();
    schedule.enabled = true;
    schedule.cycles[0] = daily(
        Trigger::Clock { minute: 480 },
        Trigger::Clock { minute: 780 },
    );
    let mut store = ScheduleStore::new(schedule);
    let mut follower = ScheduleFollower::with_seed(Site::default(), 3);
    let mut outlet = RecordingOutlet::default();

    for _ in 0..10 {
        assert!(follower.tick(&mut store, None, &mut outlet).fired.is_empty());
    }

    let start = monday() + Duration::hours(7);
    let fired = run(&mut follower, &mut store, &mut outlet, start, 120);
    assert_eq!(fired, vec![(480, on(0))]);
}
