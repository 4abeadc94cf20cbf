use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub use_static_ip: bool,
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            use_static_ip: false,
            static_ip: None,
            gateway: None,
            subnet: None,
            dns: None,
        }
    }
}

impl NetworkConfig {
    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }
}

/// GPIO wiring of the relay board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayHardwareConfig {
    pub relay_pin: i32,
    pub led_pin: i32,
    /// The indicator LED is lit when its pin is driven low.
    pub led_active_low: bool,
    pub button_pin: i32,
}

impl Default for RelayHardwareConfig {
    fn default() -> Self {
        Self {
            relay_pin: 14,
            led_pin: 13,
            led_active_low: true,
            button_pin: 0,
        }
    }
}

impl RelayHardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if !(0..=48).contains(&self.relay_pin) {
            self.relay_pin = defaults.relay_pin;
        }
        if !(0..=48).contains(&self.led_pin) {
            self.led_pin = defaults.led_pin;
        }
        if !(0..=48).contains(&self.button_pin) {
            self.button_pin = defaults.button_pin;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub relay: RelayHardwareConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timezone: "America/Los_Angeles".to_string(),
            network: NetworkConfig::default(),
            relay: RelayHardwareConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.timezone = self.timezone.trim().to_string();
        if self.timezone.is_empty() {
            self.timezone = Self::default().timezone;
        }
        self.relay.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sanitize_restores_bad_pins_and_blank_timezone() {
        let mut runtime = RuntimeConfig {
            timezone: "  ".to_string(),
            relay: RelayHardwareConfig {
                relay_pin: -1,
                led_pin: 99,
                led_active_low: false,
                button_pin: 4,
            },
            ..RuntimeConfig::default()
        };
        runtime.sanitize();

        assert_eq!(runtime.timezone, "America/Los_Angeles");
        assert_eq!(
            runtime.relay,
            RelayHardwareConfig {
                relay_pin: 14,
                led_pin: 13,
                led_active_low: false,
                button_pin: 4,
            }
        );
    }

    #[test]
    fn older_blobs_without_hardware_section_load() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{"timezone":"Europe/London"}"#).unwrap();
        assert_eq!(runtime.timezone, "Europe/London");
        assert_eq!(runtime.relay, RelayHardwareConfig::default());
        assert!(!runtime.network.has_station_credentials());
    }
}
