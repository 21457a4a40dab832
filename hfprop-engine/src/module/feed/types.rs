///! Feed result types

use chrono::{DateTime, Utc};
use hfprop_common::Band;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::module::state::{PropagationState, ReliabilityModifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Day,
    Night,
}

/// Reported condition of one band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandCondition {
    pub band: Band,
    /// `None` applies to both day and night
    pub time: Option<TimeOfDay>,
    /// Multiplier for the band's base reliability
    pub modifier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandConditionsReport {
    pub fetched_at: DateTime<Utc>,
    pub conditions: Vec<BandCondition>,
}

impl BandConditionsReport {
    /// Fold the conditions into one modifier per band. Later entries win,
    /// a half of the day nobody reported on stays neutral.
    pub fn modifiers(&self) -> HashMap<Band, ReliabilityModifier> {
        let mut modifiers: HashMap<Band, ReliabilityModifier> = HashMap::new();

        for condition in &self.conditions {
            let entry = modifiers
                .entry(condition.band)
                .or_insert_with(|| ReliabilityModifier::uniform(1.0));
            match condition.time {
                Some(TimeOfDay::Day) => entry.day = condition.modifier,
                Some(TimeOfDay::Night) => entry.night = condition.modifier,
                None => *entry = ReliabilityModifier::uniform(condition.modifier),
            }
        }

        modifiers
    }

    /// Replace the state's band modifiers. Returns true if they changed.
    pub fn apply_to(&self, state: &mut PropagationState) -> bool {
        let modifiers = self.modifiers();
        if state.band_modifiers == modifiers {
            return false;
        }
        state.band_modifiers = modifiers;
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolarWeatherReport {
    pub fetched_at: DateTime<Utc>,
    /// Latest 10.7 cm flux, if the flux product was readable
    pub solar_flux_index: Option<f64>,
    /// Latest planetary K-index, if the K-index product was readable
    pub k_index: Option<f64>,
}

impl SolarWeatherReport {
    /// Copy the available indices into the state (clamped by the setters).
    /// Returns true if either changed.
    pub fn apply_to(&self, state: &mut PropagationState) -> bool {
        let mut changed = false;
        if let Some(sfi) = self.solar_flux_index.filter(|v| v.is_finite()) {
            changed |= state.set_solar_flux_index(sfi.round() as i64);
        }
        if let Some(k_index) = self.k_index.filter(|v| v.is_finite()) {
            changed |= state.set_k_index(k_index.round() as i64);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(conditions: Vec<BandCondition>) -> BandConditionsReport {
        BandConditionsReport {
            fetched_at: Utc::now(),
            conditions,
        }
    }

    #[test]
    fn test_modifiers_merge_day_and_night() {
        let report = report(vec![
            BandCondition { band: Band::M20, time: Some(TimeOfDay::Day), modifier: 1.2 },
            BandCondition { band: Band::M20, time: Some(TimeOfDay::Night), modifier: 0.6 },
            BandCondition { band: Band::M40, time: Some(TimeOfDay::Night), modifier: 0.2 },
            BandCondition { band: Band::M10, time: None, modifier: 1.0 },
        ]);

        let modifiers = report.modifiers();
        assert_eq!(modifiers[&Band::M20], ReliabilityModifier { day: 1.2, night: 0.6 });
        assert_eq!(modifiers[&Band::M40], ReliabilityModifier { day: 1.0, night: 0.2 });
        assert_eq!(modifiers[&Band::M10], ReliabilityModifier::uniform(1.0));
        assert!(!modifiers.contains_key(&Band::M6));
    }

    #[test]
    fn test_band_report_apply_detects_change() {
        let report = report(vec![BandCondition { band: Band::M20, time: None, modifier: 0.6 }]);
        let mut state = PropagationState::default();

        assert!(report.apply_to(&mut state));
        assert!(!report.apply_to(&mut state));
        assert_eq!(state.band_modifiers.len(), 1);
    }

    #[test]
    fn test_solar_report_apply() {
        let mut state = PropagationState::default();
        let report = SolarWeatherReport {
            fetched_at: Utc::now(),
            solar_flux_index: Some(151.6),
            k_index: None,
        };

        assert!(report.apply_to(&mut state));
        assert_eq!(state.solar_flux_index, 152);
        assert_eq!(state.k_index, 3);
        assert!(!report.apply_to(&mut state));

        let stormy = SolarWeatherReport {
            fetched_at: Utc::now(),
            solar_flux_index: None,
            k_index: Some(11.0),
        };
        assert!(stormy.apply_to(&mut state));
        assert_eq!(state.k_index, 9);
    }

    #[test]
    fn test_solar_report_ignores_non_finite() {
        let mut state = PropagationState::default();
        let report = SolarWeatherReport {
            fetched_at: Utc::now(),
            solar_flux_index: Some(f64::NAN),
            k_index: Some(f64::INFINITY),
        };

        assert!(!report.apply_to(&mut state));
        assert_eq!(state.solar_flux_index, 120);
        assert_eq!(state.k_index, 3);
    }
}
