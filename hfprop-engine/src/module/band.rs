///! Band model - static band table, MUF/LUF formulas and band recommendation
///!
///! Values are approximate and simplified for simulation purposes.

use hfprop_common::{Band, Season};
use std::cmp::Ordering;

use crate::error::{PropagationError, Result};

/// Propagation characteristics of one band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandDefinition {
    pub band: Band,
    pub center_frequency_mhz: f64,
    /// Minimum effective distance (skip zone below)
    pub min_distance_km: f64,
    /// Maximum effective distance
    pub max_distance_km: f64,
    /// Base reliability factor (0.0 to 1.0)
    pub base_reliability: f64,
    pub day_factor: f64,
    pub night_factor: f64,
}

impl BandDefinition {
    const fn new(
        band: Band,
        center_frequency_mhz: f64,
        min_distance_km: f64,
        max_distance_km: f64,
        base_reliability: f64,
        day_factor: f64,
        night_factor: f64,
    ) -> Self {
        Self {
            band,
            center_frequency_mhz,
            min_distance_km,
            max_distance_km,
            base_reliability,
            day_factor,
            night_factor,
        }
    }

    pub fn contains(&self, distance_km: f64) -> bool {
        distance_km >= self.min_distance_km && distance_km <= self.max_distance_km
    }

    /// Distance from the middle of the effective range, relative to its width.
    /// 0.0 is dead centre, 0.5 is at either edge.
    fn centrality(&self, distance_km: f64) -> f64 {
        let width = (self.max_distance_km - self.min_distance_km).max(f64::EPSILON);
        let middle = (self.min_distance_km + self.max_distance_km) / 2.0;
        (distance_km - middle).abs() / width
    }

    pub fn group(&self) -> BandGroup {
        BandGroup::of(self.band)
    }
}

/// Day/night behaviour class of a band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandGroup {
    /// 160m-60m, better at night
    Low,
    /// 40m-20m, neutral
    Mid,
    /// 17m-6m, better by day
    High,
}

impl BandGroup {
    pub fn of(band: Band) -> Self {
        match band {
            Band::M160 | Band::M80 | Band::M60 => BandGroup::Low,
            Band::M40 | Band::M30 | Band::M20 => BandGroup::Mid,
            Band::M17 | Band::M15 | Band::M10 | Band::M6 => BandGroup::High,
        }
    }
}

pub const DEFAULT_BAND_DEFINITIONS: [BandDefinition; 10] = [
    // 1.8-2.0 MHz, local/regional at night
    BandDefinition::new(Band::M160, 1.9, 0.0, 1000.0, 0.8, 0.5, 1.5),
    BandDefinition::new(Band::M80, 3.75, 0.0, 1500.0, 0.85, 0.6, 1.4),
    BandDefinition::new(Band::M60, 5.35, 200.0, 2000.0, 0.8, 0.7, 1.3),
    BandDefinition::new(Band::M40, 7.15, 500.0, 3000.0, 0.9, 0.8, 1.2),
    BandDefinition::new(Band::M30, 10.125, 800.0, 4000.0, 0.85, 0.9, 1.1),
    // The workhorse DX band
    BandDefinition::new(Band::M20, 14.175, 1000.0, 12000.0, 0.95, 1.3, 0.7),
    BandDefinition::new(Band::M17, 18.118, 1500.0, 12000.0, 0.9, 1.4, 0.6),
    BandDefinition::new(Band::M15, 21.225, 2000.0, 15000.0, 0.85, 1.5, 0.5),
    BandDefinition::new(Band::M10, 28.85, 3000.0, 20000.0, 0.8, 1.6, 0.4),
    // Unpredictable, long openings only
    BandDefinition::new(Band::M6, 52.0, 5000.0, 25000.0, 0.7, 1.7, 0.3),
];

/// Nearest amateur band bucket for a frequency in MHz
pub fn frequency_to_band(frequency_mhz: f64) -> Option<Band> {
    let band = match frequency_mhz {
        f if f < 2.0 => Band::M160,
        f if f < 5.0 => Band::M80,
        f if f < 6.0 => Band::M60,
        f if f < 9.0 => Band::M40,
        f if f < 12.0 => Band::M30,
        f if f < 16.0 => Band::M20,
        f if f < 20.0 => Band::M17,
        f if f < 25.0 => Band::M15,
        f if f < 40.0 => Band::M10,
        f if f < 60.0 => Band::M6,
        _ => return None,
    };
    Some(band)
}

/// Distance steps shared by the MUF and LUF tables
fn distance_step(distance_km: f64) -> usize {
    match distance_km {
        d if d < 500.0 => 0,
        d if d < 1500.0 => 1,
        d if d < 3000.0 => 2,
        _ => 3,
    }
}

fn season_factor(season: Season) -> f64 {
    match season {
        Season::Winter => 0.8,
        Season::Spring => 1.1,
        Season::Summer => 1.2,
        Season::Fall => 1.0,
    }
}

/// Distance beyond which a path needs several hops
const MULTI_HOP_DISTANCE_KM: f64 = 4000.0;

/// Maximum usable frequency (MHz) of a path.
///
/// Grows with daylight and solar flux, shrinks beyond ~4000 km.
pub fn calculate_muf(distance_km: f64, day_fraction: f64, season: Season, sfi: u32) -> f64 {
    const BASE_MUF: [f64; 4] = [7.0, 14.0, 21.0, 28.0];

    let base = BASE_MUF[distance_step(distance_km)];
    let day_night = 0.7 + 0.6 * day_fraction.clamp(0.0, 1.0);
    let sfi_factor = 0.5 + sfi as f64 / 200.0;
    let multi_hop = if distance_km > MULTI_HOP_DISTANCE_KM {
        1.0 / (1.0 + (distance_km - MULTI_HOP_DISTANCE_KM) / 20000.0)
    } else {
        1.0
    };

    base * day_night * season_factor(season) * sfi_factor * multi_hop
}

/// Lowest usable frequency (MHz) of a path.
///
/// Rises with D-layer absorption (daylight) and geomagnetic activity.
pub fn calculate_luf(distance_km: f64, day_fraction: f64, k_index: u8) -> f64 {
    const BASE_LUF: [f64; 4] = [1.8, 3.5, 7.0, 10.0];

    let base = BASE_LUF[distance_step(distance_km)];
    let day_night = 0.5 + 0.8 * day_fraction.clamp(0.0, 1.0);
    let k_factor = 1.0 + k_index as f64 / 10.0;

    base * day_night * k_factor
}

pub fn is_usable(frequency_mhz: f64, muf_mhz: f64, luf_mhz: f64) -> bool {
    luf_mhz <= frequency_mhz && frequency_mhz <= muf_mhz
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    if (a - b).abs() < 1e-9 {
        Ordering::Equal
    } else {
        a.partial_cmp(&b).unwrap_or(Ordering::Equal)
    }
}

/// Band table with lookups
#[derive(Debug, Clone)]
pub struct BandModel {
    definitions: Vec<BandDefinition>,
}

impl Default for BandModel {
    fn default() -> Self {
        Self {
            definitions: DEFAULT_BAND_DEFINITIONS.to_vec(),
        }
    }
}

impl BandModel {
    /// Build a model from a custom table. Entries are kept in band order.
    pub fn with_definitions(mut definitions: Vec<BandDefinition>) -> Result<Self> {
        if definitions.is_empty() {
            return Err(PropagationError::InvalidBandTable("table is empty".to_string()));
        }

        definitions.sort_by_key(|def| def.band);
        for pair in definitions.windows(2) {
            if pair[0].band == pair[1].band {
                return Err(PropagationError::InvalidBandTable(format!(
                    "duplicate entry for {}",
                    pair[0].band
                )));
            }
        }
        for def in &definitions {
            if def.min_distance_km > def.max_distance_km {
                return Err(PropagationError::InvalidBandTable(format!(
                    "{}: min distance {} exceeds max distance {}",
                    def.band, def.min_distance_km, def.max_distance_km
                )));
            }
            if !(0.0..=1.0).contains(&def.base_reliability) {
                return Err(PropagationError::InvalidBandTable(format!(
                    "{}: reliability {} outside 0..=1",
                    def.band, def.base_reliability
                )));
            }
        }

        Ok(Self { definitions })
    }

    pub fn definitions(&self) -> &[BandDefinition] {
        &self.definitions
    }

    pub fn definition(&self, band: Band) -> Option<&BandDefinition> {
        self.definitions.iter().find(|def| def.band == band)
    }

    /// Position of a band in the table
    pub fn band_index(&self, band: Band) -> Option<usize> {
        self.definitions.iter().position(|def| def.band == band)
    }

    /// True when two bands are neighbours in the table
    pub fn are_adjacent(&self, a: Band, b: Band) -> bool {
        match (self.band_index(a), self.band_index(b)) {
            (Some(i), Some(j)) => i.abs_diff(j) == 1,
            _ => false,
        }
    }

    pub fn band_to_frequency(&self, band: Band) -> Option<f64> {
        self.definition(band).map(|def| def.center_frequency_mhz)
    }

    /// Band whose effective range best contains the distance.
    ///
    /// Among containing bands the one nearest the middle of its range wins,
    /// ties go to the higher base reliability. Paths outside every range get
    /// the band reaching closest.
    pub fn recommend_band(&self, distance_km: f64) -> Band {
        self.best_containing(self.definitions.iter(), distance_km)
            .unwrap_or_else(|| self.nearest_band(distance_km))
    }

    /// Like [`recommend_band`](Self::recommend_band), restricted to bands
    /// whose centre frequency lies between LUF and MUF. `None` when no
    /// usable band contains the distance.
    pub fn recommend_usable_band(&self, distance_km: f64, muf_mhz: f64, luf_mhz: f64) -> Option<Band> {
        let usable = self
            .definitions
            .iter()
            .filter(|def| is_usable(def.center_frequency_mhz, muf_mhz, luf_mhz));
        self.best_containing(usable, distance_km)
    }

    /// Bands usable on a path, in table order
    pub fn usable_bands(&self, muf_mhz: f64, luf_mhz: f64) -> Vec<Band> {
        self.definitions
            .iter()
            .filter(|def| is_usable(def.center_frequency_mhz, muf_mhz, luf_mhz))
            .map(|def| def.band)
            .collect()
    }

    fn best_containing<'a>(
        &self,
        candidates: impl Iterator<Item = &'a BandDefinition>,
        distance_km: f64,
    ) -> Option<Band> {
        candidates
            .filter(|def| def.contains(distance_km))
            .min_by(|a, b| {
                cmp_f64(a.centrality(distance_km), b.centrality(distance_km))
                    .then_with(|| cmp_f64(b.base_reliability, a.base_reliability))
            })
            .map(|def| def.band)
    }

    fn nearest_band(&self, distance_km: f64) -> Band {
        let shortest = self
            .definitions
            .iter()
            .min_by(|a, b| {
                cmp_f64(a.min_distance_km, b.min_distance_km)
                    .then_with(|| cmp_f64(b.base_reliability, a.base_reliability))
            });
        let longest = self
            .definitions
            .iter()
            .max_by(|a, b| {
                cmp_f64(a.max_distance_km, b.max_distance_km)
                    .then_with(|| cmp_f64(a.base_reliability, b.base_reliability))
            });

        match (shortest, longest) {
            (Some(short), _) if distance_km < short.min_distance_km => short.band,
            (_, Some(long)) => long.band,
            // with_definitions rejects empty tables
            _ => Band::M20,
        }
    }
}
