///! Maidenhead grid locator math
///!
///! Converts 4- and 6-character locators to the latitude/longitude of the
///! cell centre and measures great-circle distance between cells.

use crate::error::{PropagationError, Result};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Check that a locator is a 4- or 6-character Maidenhead cell.
///
/// Field letters A-R, square digits 0-9, subsquare letters a-x (any case).
pub fn validate_locator(grid: &str) -> Result<()> {
    let chars: Vec<char> = grid.chars().collect();
    let invalid = || PropagationError::InvalidLocator(grid.to_string());

    if chars.len() != 4 && chars.len() != 6 {
        return Err(invalid());
    }

    for c in &chars[..2] {
        if !('A'..='R').contains(&c.to_ascii_uppercase()) {
            return Err(invalid());
        }
    }
    for c in &chars[2..4] {
        if !c.is_ascii_digit() {
            return Err(invalid());
        }
    }
    if chars.len() == 6 {
        for c in &chars[4..6] {
            if !('a'..='x').contains(&c.to_ascii_lowercase()) {
                return Err(invalid());
            }
        }
    }

    Ok(())
}

/// Validate and bring a locator into canonical case, e.g. "jo91VR" -> "JO91vr".
pub fn normalize_locator(grid: &str) -> Result<String> {
    let grid = grid.trim();
    validate_locator(grid)?;

    Ok(grid
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if i < 2 {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect())
}

/// Latitude/longitude (degrees) of the centre of a locator cell.
pub fn locator_to_lat_lon(grid: &str) -> Result<(f64, f64)> {
    validate_locator(grid)?;

    let chars: Vec<char> = grid.chars().collect();
    let letter = |c: char, base: char| (c as u32 - base as u32) as f64;
    let digit = |c: char| c.to_digit(10).unwrap_or(0) as f64;

    let mut lon = letter(chars[0].to_ascii_uppercase(), 'A') * 20.0 - 180.0;
    let mut lat = letter(chars[1].to_ascii_uppercase(), 'A') * 10.0 - 90.0;
    lon += digit(chars[2]) * 2.0;
    lat += digit(chars[3]);

    if chars.len() == 6 {
        // Subsquares are 5' of longitude by 2.5' of latitude
        lon += letter(chars[4].to_ascii_lowercase(), 'a') * (2.0 / 24.0) + 1.0 / 24.0;
        lat += letter(chars[5].to_ascii_lowercase(), 'a') * (1.0 / 24.0) + 1.0 / 48.0;
    } else {
        lon += 1.0;
        lat += 0.5;
    }

    Ok((lat, lon))
}

/// Great-circle distance between two points in km (Haversine).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1) = (lat1.to_radians(), lon1.to_radians());
    let (lat2, lon2) = (lat2.to_radians(), lon2.to_radians());

    let d_lat = lat2 - lat1;
    let d_lon = lon2 - lon1;

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());

    EARTH_RADIUS_KM * c
}

/// Great-circle distance between the centres of two locator cells in km.
pub fn distance_km(grid1: &str, grid2: &str) -> Result<f64> {
    let (lat1, lon1) = locator_to_lat_lon(grid1)?;
    let (lat2, lon2) = locator_to_lat_lon(grid2)?;
    Ok(haversine_km(lat1, lon1, lat2, lon2))
}
