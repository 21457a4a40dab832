///! Propagation state - solar/geomagnetic indices and feature switches
///!
///! Owned and mutated by the engine; signal computations receive a snapshot.

use chrono::{DateTime, Utc};
use hfprop_common::{Band, Season};
use std::collections::HashMap;

use crate::config::EngineConfig;

pub const MIN_SOLAR_FLUX_INDEX: u32 = 60;
pub const MAX_SOLAR_FLUX_INDEX: u32 = 300;
pub const MAX_K_INDEX: u8 = 9;

/// Reliability multiplier for one band, as reported by the band feed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliabilityModifier {
    pub day: f64,
    pub night: f64,
}

impl ReliabilityModifier {
    pub fn uniform(value: f64) -> Self {
        Self {
            day: value,
            night: value,
        }
    }

    /// Weighted by the daylight fraction of the path
    pub fn blend(&self, day_fraction: f64) -> f64 {
        let day_fraction = day_fraction.clamp(0.0, 1.0);
        day_fraction * self.day + (1.0 - day_fraction) * self.night
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropagationState {
    pub solar_flux_index: u32,
    pub k_index: u8,
    pub season: Season,
    pub auto_time_enabled: bool,
    pub use_external_data: bool,
    pub use_dxview_data: bool,
    pub use_swpc_data: bool,
    pub last_external_update: Option<DateTime<Utc>>,
    /// Per-band modifiers from the latest band feed refresh
    pub band_modifiers: HashMap<Band, ReliabilityModifier>,
}

impl Default for PropagationState {
    fn default() -> Self {
        Self {
            solar_flux_index: 120,
            k_index: 3,
            season: Season::Winter,
            auto_time_enabled: true,
            use_external_data: false,
            use_dxview_data: false,
            use_swpc_data: false,
            last_external_update: None,
            band_modifiers: HashMap::new(),
        }
    }
}

impl PropagationState {
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut state = Self {
            season: config.season,
            auto_time_enabled: config.auto_time,
            use_external_data: config.use_external_data,
            use_dxview_data: config.use_dxview_data,
            use_swpc_data: config.use_swpc_data,
            ..Self::default()
        };
        state.set_solar_flux_index(config.solar_flux_index);
        state.set_k_index(config.k_index);
        state
    }

    /// Clamps to 60..=300. Returns true if the value changed.
    pub fn set_solar_flux_index(&mut self, sfi: i64) -> bool {
        let sfi = sfi.clamp(MIN_SOLAR_FLUX_INDEX as i64, MAX_SOLAR_FLUX_INDEX as i64) as u32;
        let changed = self.solar_flux_index != sfi;
        self.solar_flux_index = sfi;
        changed
    }

    /// Clamps to 0..=9. Returns true if the value changed.
    pub fn set_k_index(&mut self, k_index: i64) -> bool {
        let k_index = k_index.clamp(0, MAX_K_INDEX as i64) as u8;
        let changed = self.k_index != k_index;
        self.k_index = k_index;
        changed
    }

    pub fn dxview_active(&self) -> bool {
        self.use_external_data && self.use_dxview_data
    }

    pub fn swpc_active(&self) -> bool {
        self.use_external_data && self.use_swpc_data
    }

    /// Feed modifier for a band, 1.0 when the band feed is off or silent
    pub fn reliability_modifier(&self, band: Band, day_fraction: f64) -> f64 {
        if !self.dxview_active() {
            return 1.0;
        }
        self.band_modifiers
            .get(&band)
            .map(|modifier| modifier.blend(day_fraction))
            .unwrap_or(1.0)
    }

    /// Whether the minimum refresh interval has elapsed since the last fetch
    pub fn external_refresh_due(&self, now: DateTime<Utc>, min_interval: chrono::Duration) -> bool {
        match self.last_external_update {
            Some(last) => now - last >= min_interval,
            None => true,
        }
    }
}
