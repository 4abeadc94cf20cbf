//! Signed schedule blob.
//!
//! Storage keeps the schedule as a JSON envelope carrying a layout
//! signature and a SHA-256 digest of the serialized schedule. A blob
//! written by an older layout, or damaged in flash, is rejected and the
//! caller falls back to defaults.

use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::schedule::Schedule;

/// Bumped whenever the persisted layout changes.
pub const SCHEDULE_SIGNATURE: u16 = 0x3841;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("schedule signature {found:#06x} does not match {expected:#06x}")]
    SignatureMismatch { found: u16, expected: u16 },
    #[error("schedule digest mismatch")]
    DigestMismatch,
    #[error("malformed schedule blob: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    signature: u16,
    digest: String,
    schedule: serde_json::Value,
}

pub fn encode(schedule: &Schedule) -> Result<Vec<u8>, PersistError> {
    let body = serde_json::to_value(schedule)?;
    let envelope = Envelope {
        signature: SCHEDULE_SIGNATURE,
        digest: digest_hex(&serde_json::to_vec(&body)?),
        schedule: body,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode(raw: &[u8]) -> Result<Schedule, PersistError> {
    let envelope: Envelope = serde_json::from_slice(raw)?;
    if envelope.signature != SCHEDULE_SIGNATURE {
        return Err(PersistError::SignatureMismatch {
            found: envelope.signature,
            expected: SCHEDULE_SIGNATURE,
        });
    }

    let body = serde_json::to_vec(&envelope.schedule)?;
    if !envelope.digest.eq_ignore_ascii_case(&digest_hex(&body)) {
        return Err(PersistError::DigestMismatch);
    }

    let mut schedule: Schedule = serde_json::from_value(envelope.schedule)?;
    schedule.normalize();
    Ok(schedule)
}

/// Decode `raw`, or the default schedule when nothing usable is stored.
pub fn load_or_default(raw: Option<&[u8]>) -> Schedule {
    let Some(raw) = raw else {
        return Schedule::default();
    };

    decode(raw).unwrap_or_else(|err| {
        warn!("stored schedule rejected, using defaults: {err}");
        Schedule::default()
    })
}

fn digest_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        astro::Site,
        cycle::{Applicability, Cycle, SunEvent, Trigger},
    };

    fn sample() -> Schedule {
        let mut schedule = Schedule::default();
        schedule.enabled = true;
        schedule.site = Site {
            latitude_deg: 51.4779,
            longitude_deg: -0.0015,
            elevation_m: 46.0,
        };
        schedule.cycles[0] = Cycle {
            enabled: true,
            applicability: Applicability::Weekend,
            on: Trigger::Sun {
                event: SunEvent::Sunset,
                offset_minutes: -20,
            },
            off: Trigger::Clock { minute: 23 * 60 + 30 },
            fuzz_minutes: 15,
        };
        schedule.cycles[7] = Cycle {
            enabled: false,
            applicability: Applicability::Weekday,
            on: Trigger::Clock { minute: 5 },
            off: Trigger::Sun {
                event: SunEvent::Sunrise,
                offset_minutes: 45,
            },
            fuzz_minutes: 0,
        };
        schedule
    }

    #[test]
    fn every_field_survives_storage() {
        let schedule = sample();
        let raw = encode(&schedule).unwrap();
        assert_eq!(decode(&raw).unwrap(), schedule);
    }

    #[test]
    fn rejects_foreign_signature() {
        let mut envelope: serde_json::Value =
            serde_json::from_slice(&encode(&sample()).unwrap()).unwrap();
        envelope["signature"] = serde_json::json!(0x3840);
        let raw = serde_json::to_vec(&envelope).unwrap();

        assert!(matches!(
            decode(&raw),
            Err(PersistError::SignatureMismatch { found: 0x3840, .. })
        ));
        assert_eq!(load_or_default(Some(&raw)), Schedule::default());
    }

    #[test]
    fn rejects_tampered_body() {
        let mut envelope: serde_json::Value =
            serde_json::from_slice(&encode(&sample()).unwrap()).unwrap();
        envelope["schedule"]["enabled"] = serde_json::json!(false);
        let raw = serde_json::to_vec(&envelope).unwrap();

        assert!(matches!(decode(&raw), Err(PersistError::DigestMismatch)));
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        assert!(matches!(
            decode(b"\xff\xff\xff"),
            Err(PersistError::Malformed(_))
        ));
        assert_eq!(load_or_default(Some(b"{}")), Schedule::default());
        assert_eq!(load_or_default(None), Schedule::default());
    }
}
