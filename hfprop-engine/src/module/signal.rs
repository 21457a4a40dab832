///! Signal model - combines grid, solar and band models into a 0..=1 strength
///!
///! Pure functions of (grids, state, time); the only randomness is the fading
///! jitter, which is injected through [`JitterSource`].

use chrono::{DateTime, Utc};
use hfprop_common::Band;
use rand::Rng;

use super::band::{calculate_luf, calculate_muf, is_usable, BandDefinition, BandGroup, BandModel};
use super::grid::{haversine_km, locator_to_lat_lon};
use super::solar::day_night_fraction;
use super::state::PropagationState;
use crate::error::Result;

/// Strength inside a band's skip zone
pub const SKIP_ZONE_STRENGTH: f64 = 0.3;
/// Strength beyond a band's maximum distance
pub const OUT_OF_RANGE_STRENGTH: f64 = 0.1;

pub const JITTER_MIN: f64 = 0.8;
pub const JITTER_MAX: f64 = 1.2;

/// Minimum strength for two stations on the same band
pub const SAME_BAND_THRESHOLD: f64 = 0.5;
/// Minimum strength for two stations on neighbouring bands
pub const ADJACENT_BAND_THRESHOLD: f64 = 0.7;

/// Source of the fading multiplier applied to every computed strength
pub trait JitterSource: Send + Sync {
    /// A factor within [JITTER_MIN, JITTER_MAX]
    fn factor(&self) -> f64;
}

/// Uniformly distributed fading
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn factor(&self) -> f64 {
        rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX)
    }
}

/// Constant fading factor, clamped into the jitter bounds
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn factor(&self) -> f64 {
        self.0.clamp(JITTER_MIN, JITTER_MAX)
    }
}

/// Everything the model derived for one path
#[derive(Debug, Clone, PartialEq)]
pub struct PathReport {
    pub distance_km: f64,
    pub band: Band,
    pub day_fraction: f64,
    pub muf_mhz: f64,
    pub luf_mhz: f64,
    /// Recommended band lies between LUF and MUF
    pub usable: bool,
    pub strength: f64,
}

/// Strength from distance alone, before day/night and jitter.
///
/// Fixed constants outside the band's range, otherwise linear fall-off from
/// `reliability` at the minimum distance to zero at the maximum.
pub fn base_strength(def: &BandDefinition, distance_km: f64, reliability: f64) -> f64 {
    if distance_km < def.min_distance_km {
        SKIP_ZONE_STRENGTH
    } else if distance_km > def.max_distance_km {
        OUT_OF_RANGE_STRENGTH
    } else {
        let span = def.max_distance_km - def.min_distance_km;
        if span <= 0.0 {
            return reliability;
        }
        reliability * (1.0 - (distance_km - def.min_distance_km) / span)
    }
}

/// Day/night multiplier for a band. Low and high bands blend their day and
/// night factors by the daylight fraction of the path, mid bands are neutral.
pub fn day_night_multiplier(def: &BandDefinition, day_fraction: f64) -> f64 {
    match def.group() {
        BandGroup::Mid => 1.0,
        BandGroup::Low | BandGroup::High => {
            let day_fraction = day_fraction.clamp(0.0, 1.0);
            day_fraction * def.day_factor + (1.0 - day_fraction) * def.night_factor
        }
    }
}

/// Run the full model for a pair of locators.
pub fn evaluate_path(
    bands: &BandModel,
    grid1: &str,
    grid2: &str,
    state: &PropagationState,
    now: DateTime<Utc>,
    jitter: &dyn JitterSource,
) -> Result<PathReport> {
    let (lat1, lon1) = locator_to_lat_lon(grid1)?;
    let (lat2, lon2) = locator_to_lat_lon(grid2)?;

    let distance_km = haversine_km(lat1, lon1, lat2, lon2);
    let band = bands.recommend_band(distance_km);
    let day_fraction = day_night_fraction(lat1, lon1, lat2, lon2, now);

    let muf_mhz = calculate_muf(distance_km, day_fraction, state.season, state.solar_flux_index);
    let luf_mhz = calculate_luf(distance_km, day_fraction, state.k_index);

    let (strength, usable) = match bands.definition(band) {
        Some(def) => {
            let reliability =
                (def.base_reliability * state.reliability_modifier(band, day_fraction)).clamp(0.0, 1.0);
            let strength = base_strength(def, distance_km, reliability)
                * day_night_multiplier(def, day_fraction)
                * jitter.factor();
            (
                strength.clamp(0.0, 1.0),
                is_usable(def.center_frequency_mhz, muf_mhz, luf_mhz),
            )
        }
        None => (0.0, false),
    };

    tracing::trace!(
        "{} -> {}: {:.0} km, {}, day {:.2}, MUF {:.1}, LUF {:.1}, strength {:.3}",
        grid1,
        grid2,
        distance_km,
        band,
        day_fraction,
        muf_mhz,
        luf_mhz,
        strength
    );

    Ok(PathReport {
        distance_km,
        band,
        day_fraction,
        muf_mhz,
        luf_mhz,
        usable,
        strength,
    })
}

/// Signal strength (0..=1) between two locators.
pub fn calculate_signal_strength(
    bands: &BandModel,
    grid1: &str,
    grid2: &str,
    state: &PropagationState,
    now: DateTime<Utc>,
    jitter: &dyn JitterSource,
) -> Result<f64> {
    evaluate_path(bands, grid1, grid2, state, now, jitter).map(|report| report.strength)
}

/// Strength two stations on `band1` and `band2` need to hear each other,
/// `None` when the bands are too far apart.
pub fn communication_threshold(bands: &BandModel, band1: Band, band2: Band) -> Option<f64> {
    if band1 == band2 {
        Some(SAME_BAND_THRESHOLD)
    } else if bands.are_adjacent(band1, band2) {
        Some(ADJACENT_BAND_THRESHOLD)
    } else {
        None
    }
}
