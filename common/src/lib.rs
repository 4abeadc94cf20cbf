pub mod astro;
pub mod config;
pub mod cycle;
pub mod follower;
pub mod outlet;
pub mod persist;
pub mod schedule;
pub mod types;

pub use astro::{AstroError, Site, SunCalculator, SunMinutes, SunTimes};
pub use config::{NetworkConfig, RelayHardwareConfig, RuntimeConfig};
pub use cycle::{Applicability, Cycle, SunEvent, TimeFormatError, Trigger, MINUTES_PER_DAY};
pub use follower::{
    Edge, Phase, ResolvedCycle, ResolvedEdge, ScheduleFollower, TickOutcome, Transition,
};
pub use outlet::{Outlet, RecordingOutlet};
pub use persist::PersistError;
pub use schedule::{FormError, FormFields, Schedule, ScheduleStore, MAX_CYCLES};
pub use types::{CycleStatus, OutletStatus};
