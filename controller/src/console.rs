//! Line-oriented command interpreter shared by the serial console and the
//! web command box.

use outlet_common::{
    cycle::MAX_FUZZ_MINUTES, Applicability, Cycle, Schedule, Trigger, MAX_CYCLES,
};

use crate::device::{describe_sun, Device};

const BANNER: &str = "WiFi Outlet";
const MAX_SSID_LEN: usize = 32;
const MAX_PASSWORD_LEN: usize = 63;

const HELP: &str = "\
  help                      Print this text
  h                         Same as 'help'
  status                    Print the status of the system
  on | off | toggle         Switch the outlet
  schedule                  List the schedule
  enable | disable          Turn the whole schedule on or off
  cycle <n> on|off          Enable or disable cycle n
  cycle <n> <days> <on> <off> [fuzz]
                            Set cycle n; days is daily, weekday or weekend;
                            on/off are HH:MM, sunrise[+-m] or sunset[+-m]
  site [<lat> <lon> <elev>] Print or set the location used for sun times
  sun                       Print today's sunrise, solar noon and sunset
  tz [<zone>]               Print or set the IANA timezone
  ssid [<ssid>]             Print or set the WiFi network to join
  pw [<password>]           Print or set the WiFi password
  save                      Save the schedule and settings
";

/// What the shell must do after printing a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Effect {
    #[default]
    None,
    Save,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub text: String,
    pub effect: Effect,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            effect: Effect::None,
        }
    }
}

pub fn dispatch(line: &str, device: &mut Device) -> Reply {
    let line = line.trim();
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = words.first() else {
        return Reply::default();
    };
    let args = &words[1..];
    let rest = line[command.len()..].trim();

    match command {
        "help" | "h" => Reply::text(format!("Help for {BANNER}\n{HELP}")),
        "status" => Reply::text(status(device)),
        "on" => {
            device.set_outlet(true);
            Reply::text(outlet_state(true))
        }
        "off" => {
            device.set_outlet(false);
            Reply::text(outlet_state(false))
        }
        "toggle" => {
            let on = device.toggle();
            Reply::text(outlet_state(on))
        }
        "schedule" => Reply::text(describe_schedule(device.schedule())),
        "enable" | "disable" => {
            let enabled = command == "enable";
            device.update_schedule(|schedule| schedule.enabled = enabled);
            Reply::text(format!(
                "The schedule is {}.",
                if enabled { "enabled" } else { "disabled" }
            ))
        }
        "cycle" => Reply::text(cycle(args, device)),
        "site" => Reply::text(site(args, device)),
        "sun" => Reply::text(sun(device)),
        "tz" => Reply::text(timezone(rest, device)),
        "ssid" => Reply::text(ssid(rest, device)),
        "pw" => Reply::text(password(rest, device)),
        "save" => Reply {
            text: "Saving schedule and settings.".to_string(),
            effect: Effect::Save,
        },
        other => Reply::text(format!("Command \"{other}\" is not recognized.")),
    }
}

fn outlet_state(on: bool) -> String {
    format!("The outlet is {}.", if on { "on" } else { "off" })
}

fn status(device: &Device) -> String {
    let network = &device.runtime().network;
    let mut text = String::new();
    if network.has_station_credentials() {
        text.push_str(&format!("WiFi SSID is \"{}\".\n", network.wifi_ssid));
    }
    text.push_str(&outlet_state(device.is_outlet_on()));
    text.push('\n');
    text.push_str(&format!(
        "The schedule is {}.\n",
        if device.schedule().enabled {
            "enabled"
        } else {
            "disabled"
        }
    ));
    match device.now() {
        Some(now) => text.push_str(&format!("Local time is {}", now.format("%Y-%m-%d %H:%M %:z"))),
        None => text.push_str("The clock is not set."),
    }
    text.push_str(&format!(" (timezone {}).", device.runtime().timezone));
    text
}

fn describe_cycle(index: usize, cycle: &Cycle) -> String {
    format!(
        "  {index}: {:<3} {:<7} {:>10} -> {:<10} fuzz {}",
        if cycle.enabled { "on" } else { "off" },
        cycle.applicability.as_str(),
        cycle.on,
        cycle.off,
        cycle.fuzz_minutes
    )
}

fn describe_schedule(schedule: &Schedule) -> String {
    let mut lines = vec![format!(
        "The schedule is {}. Site {:.4}, {:.4}, {} m.",
        if schedule.enabled {
            "enabled"
        } else {
            "disabled"
        },
        schedule.site.latitude_deg,
        schedule.site.longitude_deg,
        schedule.site.elevation_m
    )];
    lines.extend(
        schedule
            .cycles
            .iter()
            .enumerate()
            .map(|(index, cycle)| describe_cycle(index, cycle)),
    );
    lines.join("\n")
}

fn cycle(args: &[&str], device: &mut Device) -> String {
    let Some(index) = args.first().and_then(|value| value.parse::<usize>().ok()) else {
        return format!("Cycle number must be 0-{}.", MAX_CYCLES - 1);
    };
    if index >= MAX_CYCLES {
        return format!("Cycle number must be 0-{}.", MAX_CYCLES - 1);
    }

    match &args[1..] {
        [] => describe_cycle(index, &device.schedule().cycles[index]),
        [switch @ ("on" | "off")] => {
            let enabled = *switch == "on";
            device.update_schedule(|schedule| schedule.cycles[index].enabled = enabled);
            describe_cycle(index, &device.schedule().cycles[index])
        }
        [days, on, off, fuzz @ ..] if fuzz.len() <= 1 => {
            let Ok(applicability) = days.parse::<Applicability>() else {
                return format!("\"{days}\" is not one of daily, weekday or weekend.");
            };
            let on = match on.parse::<Trigger>() {
                Ok(trigger) => trigger,
                Err(err) => return format!("Bad on time: {err}."),
            };
            let off = match off.parse::<Trigger>() {
                Ok(trigger) => trigger,
                Err(err) => return format!("Bad off time: {err}."),
            };
            let fuzz_minutes = match fuzz.first() {
                Some(value) => match value.parse::<u16>() {
                    Ok(minutes) if minutes <= MAX_FUZZ_MINUTES => minutes,
                    Ok(_) => return format!("Fuzz must be 0-{MAX_FUZZ_MINUTES} minutes."),
                    Err(_) => return format!("Bad fuzz \"{value}\"."),
                },
                None => 0,
            };

            device.update_schedule(|schedule| {
                schedule.cycles[index] = Cycle {
                    enabled: true,
                    applicability,
                    on,
                    off,
                    fuzz_minutes,
                };
            });
            describe_cycle(index, &device.schedule().cycles[index])
        }
        _ => "Usage: cycle <n> on|off or cycle <n> <days> <on> <off> [fuzz]".to_string(),
    }
}

fn site(args: &[&str], device: &mut Device) -> String {
    match args {
        [] => {}
        [lat, lon, elev] => {
            let parsed = (
                lat.parse::<f64>().ok().filter(|v| (-90.0..=90.0).contains(v)),
                lon.parse::<f64>().ok().filter(|v| (-180.0..=180.0).contains(v)),
                elev.parse::<f64>().ok().filter(|v| (0.0..=9_000.0).contains(v)),
            );
            let (Some(lat), Some(lon), Some(elev)) = parsed else {
                return "Latitude must be -90..90, longitude -180..180, elevation 0..9000 m."
                    .to_string();
            };
            device.update_schedule(|schedule| {
                schedule.site.latitude_deg = lat;
                schedule.site.longitude_deg = lon;
                schedule.site.elevation_m = elev;
            });
        }
        _ => return "Usage: site [<lat> <lon> <elev>]".to_string(),
    }

    let site = device.schedule().site;
    format!(
        "Site is {:.4}, {:.4}, {} m.",
        site.latitude_deg, site.longitude_deg, site.elevation_m
    )
}

fn sun(device: &mut Device) -> String {
    let Some(now) = device.now() else {
        return "The clock is not set.".to_string();
    };
    match device.sun_today(now) {
        Ok(sun) => format!("{}.", describe_sun(&sun)),
        Err(err) => format!("No sunrise or sunset today: {err}."),
    }
}

fn timezone(zone: &str, device: &mut Device) -> String {
    if zone.is_empty() {
        return format!("Timezone is \"{}\".", device.runtime().timezone);
    }
    match device.set_timezone(zone) {
        Ok(()) => format!("Set timezone to \"{zone}\"."),
        Err(err) => format!("Cannot set timezone: {err}."),
    }
}

fn ssid(value: &str, device: &mut Device) -> String {
    let network = &mut device.runtime_mut().network;
    if value.is_empty() {
        format!("SSID is \"{}\".", network.wifi_ssid)
    } else if value.len() > MAX_SSID_LEN {
        format!("Specified SSID is too long. Maximum length is {MAX_SSID_LEN}.")
    } else {
        network.wifi_ssid = value.to_string();
        format!("Set SSID to \"{value}\".")
    }
}

fn password(value: &str, device: &mut Device) -> String {
    let network = &mut device.runtime_mut().network;
    if value.is_empty() {
        format!("Password is \"{}\".", network.wifi_pass)
    } else if value.len() > MAX_PASSWORD_LEN {
        format!("Password is too long. Maximum length is {MAX_PASSWORD_LEN}.")
    } else {
        network.wifi_pass = value.to_string();
        format!("Set password to \"{value}\".")
    }
}
