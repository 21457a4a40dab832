///! Solar geometry - zenith angle and day/night fraction of a path
///!
///! Low-precision approximations: declination from the day of year and hour
///! angle from UTC, no refraction or equation-of-time correction.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Axial tilt used for the declination approximation (degrees)
pub const SOLAR_DECLINATION_MAX: f64 = 23.44;

/// Number of samples taken along a path, endpoints included
const PATH_SAMPLES: usize = 11;

/// Solar declination (degrees) for a zero-based day of year.
pub fn solar_declination_deg(day_of_year0: u32) -> f64 {
    let angle = 2.0 * std::f64::consts::PI * (day_of_year0 as f64 + 10.0) / 365.0;
    -SOLAR_DECLINATION_MAX * angle.cos()
}

/// Solar zenith angle (degrees, 0..=180) at a location and instant.
pub fn solar_zenith_angle(lat: f64, lon: f64, timestamp: DateTime<Utc>) -> f64 {
    let declination = solar_declination_deg(timestamp.ordinal0()).to_radians();

    let utc_hours = timestamp.hour() as f64
        + timestamp.minute() as f64 / 60.0
        + timestamp.second() as f64 / 3600.0;
    let hour_angle = ((utc_hours - 12.0) * 15.0 + lon).to_radians();

    let lat = lat.to_radians();
    let cos_zenith = lat.sin() * declination.sin() + lat.cos() * declination.cos() * hour_angle.cos();

    cos_zenith.clamp(-1.0, 1.0).acos().to_degrees()
}

pub fn is_daylight(lat: f64, lon: f64, timestamp: DateTime<Utc>) -> bool {
    solar_zenith_angle(lat, lon, timestamp) < 90.0
}

/// Fraction (0..=1) of the great-circle path between two points that is in
/// daylight at `timestamp`.
pub fn day_night_fraction(
    lat1: f64,
    lon1: f64,
    lat2: f64,
    lon2: f64,
    timestamp: DateTime<Utc>,
) -> f64 {
    let points = great_circle_points(lat1, lon1, lat2, lon2, PATH_SAMPLES);
    let day_points = points
        .iter()
        .filter(|(lat, lon)| is_daylight(*lat, *lon, timestamp))
        .count();

    day_points as f64 / points.len() as f64
}

/// Evenly spaced points along the great circle from (lat1, lon1) to
/// (lat2, lon2). A zero-length path yields a single point.
fn great_circle_points(lat1: f64, lon1: f64, lat2: f64, lon2: f64, samples: usize) -> Vec<(f64, f64)> {
    let to_vector = |lat: f64, lon: f64| {
        let (lat, lon) = (lat.to_radians(), lon.to_radians());
        [lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin()]
    };
    let a = to_vector(lat1, lon1);
    let b = to_vector(lat2, lon2);

    // Haversine form keeps identical endpoints at exactly zero
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let h = ((phi2 - phi1) / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * ((lon2 - lon1).to_radians() / 2.0).sin().powi(2);
    let central_angle = 2.0 * h.sqrt().atan2((1.0 - h).max(0.0).sqrt());

    if central_angle < 1e-12 {
        return vec![(lat1, lon1)];
    }

    let sin_angle = central_angle.sin();
    (0..samples)
        .map(|i| {
            let f = i as f64 / (samples - 1) as f64;
            if sin_angle.abs() < 1e-9 {
                // Antipodal endpoints: any great circle works, fall back to
                // plain interpolation of the coordinates
                return (lat1 + f * (lat2 - lat1), lon1 + f * (lon2 - lon1));
            }
            let wa = ((1.0 - f) * central_angle).sin() / sin_angle;
            let wb = (f * central_angle).sin() / sin_angle;
            let x = wa * a[0] + wb * b[0];
            let y = wa * a[1] + wb * b[1];
            let z = wa * a[2] + wb * b[2];
            (
                z.atan2((x * x + y * y).sqrt()).to_degrees(),
                y.atan2(x).to_degrees(),
            )
        })
        .collect()
}
