use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const J2000: f64 = 2_451_545.0;
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const SECONDS_PER_DAY: f64 = 86_400.0;
// Terrestrial time leads UTC by this many seconds (TT - UTC).
const TT_MINUS_UTC_SECONDS: f64 = 69.184;
const OBLIQUITY_DEG: f64 = 23.4397;
const HORIZON_REFRACTION_DEG: f64 = -0.833;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum AstroError {
    /// The sun stays above the horizon all day.
    #[error("sun does not set on this day (cos hour angle {cos_hour_angle:.3})")]
    PolarDay { cos_hour_angle: f64 },
    /// The sun stays below the horizon all day.
    #[error("sun does not rise on this day (cos hour angle {cos_hour_angle:.3})")]
    PolarNight { cos_hour_angle: f64 },
}

/// Observation site used for sunrise and sunset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Site {
    #[serde(rename = "latitude")]
    pub latitude_deg: f64,
    #[serde(rename = "longitude")]
    pub longitude_deg: f64,
    #[serde(rename = "elevation")]
    pub elevation_m: f64,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            latitude_deg: 37.7749,
            longitude_deg: -122.4194,
            elevation_m: 16.0,
        }
    }
}

impl Site {
    pub fn sanitize(&mut self) {
        if !self.latitude_deg.is_finite() {
            self.latitude_deg = 0.0;
        }
        if !self.longitude_deg.is_finite() {
            self.longitude_deg = 0.0;
        }
        if !self.elevation_m.is_finite() {
            self.elevation_m = 0.0;
        }
        self.latitude_deg = self.latitude_deg.clamp(-90.0, 90.0);
        self.longitude_deg = self.longitude_deg.clamp(-180.0, 180.0);
        self.elevation_m = self.elevation_m.clamp(0.0, 9_000.0);
    }
}

/// Sunrise, solar transit and sunset for one day at one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunTimes {
    pub sunrise: DateTime<Utc>,
    pub solar_noon: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
}

/// [`SunTimes`] expressed as local minute-of-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SunMinutes {
    pub sunrise: u16,
    #[serde(rename = "solarNoon")]
    pub solar_noon: u16,
    pub sunset: u16,
}

impl SunTimes {
    pub fn local_minutes(&self, offset: &FixedOffset) -> SunMinutes {
        SunMinutes {
            sunrise: local_minute(self.sunrise, offset),
            solar_noon: local_minute(self.solar_noon, offset),
            sunset: local_minute(self.sunset, offset),
        }
    }
}

fn local_minute(instant: DateTime<Utc>, offset: &FixedOffset) -> u16 {
    let local = instant.with_timezone(offset);
    (local.hour() * 60 + local.minute()) as u16
}

/// Sunrise/sunset calculator with a one-day memo.
///
/// The scheduler asks for the same day many times and a new day at most
/// once a day, so a single cached slot keyed by Julian day is enough.
#[derive(Debug, Clone)]
pub struct SunCalculator {
    site: Site,
    cache: Option<(i32, Result<SunTimes, AstroError>)>,
}

impl SunCalculator {
    pub fn new(site: Site) -> Self {
        Self { site, cache: None }
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn set_site(&mut self, site: Site) {
        if self.site != site {
            self.site = site;
            self.cache = None;
        }
    }

    /// Sun times for the local calendar `date` in the zone `offset`.
    pub fn sun_times(
        &mut self,
        date: NaiveDate,
        offset: &FixedOffset,
    ) -> Result<SunTimes, AstroError> {
        let day = julian_day(date, offset);
        if let Some((cached_day, result)) = self.cache {
            if cached_day == day {
                return result;
            }
        }

        let result = compute(day, &self.site);
        self.cache = Some((day, result));
        result
    }

    pub fn sunrise(
        &mut self,
        date: NaiveDate,
        offset: &FixedOffset,
    ) -> Result<DateTime<Utc>, AstroError> {
        self.sun_times(date, offset).map(|times| times.sunrise)
    }

    pub fn solar_noon(
        &mut self,
        date: NaiveDate,
        offset: &FixedOffset,
    ) -> Result<DateTime<Utc>, AstroError> {
        self.sun_times(date, offset).map(|times| times.solar_noon)
    }

    pub fn sunset(
        &mut self,
        date: NaiveDate,
        offset: &FixedOffset,
    ) -> Result<DateTime<Utc>, AstroError> {
        self.sun_times(date, offset).map(|times| times.sunset)
    }

    #[cfg(test)]
    fn is_cached(&self, date: NaiveDate, offset: &FixedOffset) -> bool {
        let day = julian_day(date, offset);
        matches!(self.cache, Some((cached, _)) if cached == day)
    }
}

/// Days since J2000 for local midnight of `date`, rounded up.
pub fn julian_day(date: NaiveDate, offset: &FixedOffset) -> i32 {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    let timestamp = match offset.from_local_datetime(&midnight).single() {
        Some(local) => local.timestamp(),
        None => midnight.and_utc().timestamp(),
    };
    let julian_date = timestamp as f64 / SECONDS_PER_DAY + UNIX_EPOCH_JD;
    (julian_date - (J2000 + 0.0009) + TT_MINUS_UTC_SECONDS / SECONDS_PER_DAY).ceil() as i32
}

fn compute(day: i32, site: &Site) -> Result<SunTimes, AstroError> {
    let mean_solar_time = day as f64 + 0.0009 - site.longitude_deg / 360.0;

    let anomaly_deg = (357.5291 + 0.985_600_28 * mean_solar_time).rem_euclid(360.0);
    let anomaly = anomaly_deg.to_radians();

    let center_deg =
        1.9148 * anomaly.sin() + 0.02 * (2.0 * anomaly).sin() + 0.0003 * (3.0 * anomaly).sin();

    let ecliptic_longitude =
        (anomaly_deg + center_deg + 180.0 + 102.9372).rem_euclid(360.0).to_radians();

    let transit = J2000 + mean_solar_time + 0.0053 * anomaly.sin()
        - 0.0069 * (2.0 * ecliptic_longitude).sin();

    let sin_declination = ecliptic_longitude.sin() * OBLIQUITY_DEG.to_radians().sin();
    let cos_declination = sin_declination.asin().cos();

    let latitude = site.latitude_deg.to_radians();
    let horizon_deg = HORIZON_REFRACTION_DEG - 2.076 * site.elevation_m.max(0.0).sqrt() / 60.0;
    let cos_hour_angle = (horizon_deg.to_radians().sin() - latitude.sin() * sin_declination)
        / (latitude.cos() * cos_declination);

    if cos_hour_angle.is_nan() || cos_hour_angle < -1.0 {
        return Err(AstroError::PolarDay { cos_hour_angle });
    }
    if cos_hour_angle > 1.0 {
        return Err(AstroError::PolarNight { cos_hour_angle });
    }

    let hour_angle_days = cos_hour_angle.acos().to_degrees() / 360.0;

    Ok(SunTimes {
        sunrise: julian_date_to_utc(transit - hour_angle_days),
        solar_noon: julian_date_to_utc(transit),
        sunset: julian_date_to_utc(transit + hour_angle_days),
    })
}

fn julian_date_to_utc(julian_date: f64) -> DateTime<Utc> {
    let seconds = ((julian_date - UNIX_EPOCH_JD) * SECONDS_PER_DAY) as i64;
    DateTime::from_timestamp(seconds, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset_hours(hours: i32) -> FixedOffset {
        FixedOffset::east_opt(hours * 3600).unwrap()
    }

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn assert_near(actual: u16, expected: u16, tolerance: u16) {
        assert!(
            actual.abs_diff(expected) <= tolerance,
            "expected {expected}±{tolerance}, got {actual}"
        );
    }

    #[test]
    fn san_francisco_summer_solstice() {
        let mut calc = SunCalculator::new(Site::default());
        let pdt = offset_hours(-7);
        let minutes = calc
            .sun_times(date(2024, 6, 21), &pdt)
            .unwrap()
            .local_minutes(&pdt);

        // 05:48, 13:12, 20:37 local.
        assert_near(minutes.sunrise, 348, 2);
        assert_near(minutes.solar_noon, 792, 2);
        assert_near(minutes.sunset, 1237, 2);
    }

    #[test]
    fn greenwich_equinox_is_about_twelve_hours() {
        let mut calc = SunCalculator::new(Site {
            latitude_deg: 51.4779,
            longitude_deg: 0.0,
            elevation_m: 0.0,
        });
        let utc = offset_hours(0);
        let minutes = calc
            .sun_times(date(2024, 3, 20), &utc)
            .unwrap()
            .local_minutes(&utc);

        assert_near(minutes.sunrise, 363, 2);
        assert_near(minutes.sunset, 1093, 2);
        assert!(minutes.sunrise < minutes.solar_noon && minutes.solar_noon < minutes.sunset);
    }

    #[test]
    fn julian_day_counts_from_j2000() {
        assert_eq!(julian_day(date(2024, 6, 21), &offset_hours(-7)), 8938);
        assert_eq!(julian_day(date(2024, 3, 20), &offset_hours(0)), 8845);
    }

    #[test]
    fn polar_latitudes_report_domain_errors() {
        let mut calc = SunCalculator::new(Site {
            latitude_deg: 78.22,
            longitude_deg: 15.65,
            elevation_m: 0.0,
        });

        assert!(matches!(
            calc.sun_times(date(2024, 6, 21), &offset_hours(2)),
            Err(AstroError::PolarDay { .. })
        ));
        assert!(matches!(
            calc.sun_times(date(2024, 12, 21), &offset_hours(1)),
            Err(AstroError::PolarNight { .. })
        ));
    }

    #[test]
    fn elevation_moves_sunrise_earlier() {
        let pdt = offset_hours(-7);
        let day = date(2024, 6, 21);
        let mut sea_level = SunCalculator::new(Site {
            elevation_m: 0.0,
            ..Site::default()
        });
        let mut mountain = SunCalculator::new(Site {
            elevation_m: 2_500.0,
            ..Site::default()
        });

        let low = sea_level.sunrise(day, &pdt).unwrap();
        let high = mountain.sunrise(day, &pdt).unwrap();
        assert!(high < low);
    }

    #[test]
    fn caches_one_day_and_resets_on_site_change() {
        let pdt = offset_hours(-7);
        let mut calc = SunCalculator::new(Site::default());
        let first = calc.sun_times(date(2024, 6, 21), &pdt).unwrap();
        assert!(calc.is_cached(date(2024, 6, 21), &pdt));
        assert_eq!(calc.sunset(date(2024, 6, 21), &pdt).unwrap(), first.sunset);

        calc.set_site(Site {
            latitude_deg: 47.6,
            longitude_deg: -122.3,
            elevation_m: 50.0,
        });
        assert!(!calc.is_cached(date(2024, 6, 21), &pdt));
        let seattle = calc.sun_times(date(2024, 6, 21), &pdt).unwrap();
        assert_ne!(seattle, first);
    }

    #[test]
    fn sanitize_clamps_out_of_range_site() {
        let mut site = Site {
            latitude_deg: 123.0,
            longitude_deg: f64::NAN,
            elevation_m: -10.0,
        };
        site.sanitize();
        assert_eq!(site.latitude_deg, 90.0);
        assert_eq!(site.longitude_deg, 0.0);
        assert_eq!(site.elevation_m, 0.0);
    }
}
