///! Feed payload parsers
///!
///! Band conditions come as hamqsl-style XML or as JSON; solar weather comes
///! from the NOAA SWPC JSON products, either as an array of objects or as an
///! array of arrays with a header row.

use hfprop_common::Band;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::warn;

use super::types::{BandCondition, TimeOfDay};
use crate::error::{PropagationError, Result};

const BAND_KEYS: [&str; 2] = ["band", "name"];
const LEVEL_KEYS: [&str; 4] = ["level", "condition", "reliability", "value"];
const FLUX_KEYS: [&str; 4] = ["flux", "f10.7", "f107", "observed_flux"];
const KP_KEYS: [&str; 4] = ["kp", "kp_index", "k_index", "estimated_kp"];

/// Reliability modifier for a reported band level.
///
/// Named levels map to fixed multipliers, a number v in 0..=1 (or a
/// percentage) maps to 0.2 + v.
pub fn level_modifier(level: &str) -> Option<f64> {
    let level = level.trim().to_ascii_lowercase();
    match level.as_str() {
        "good" => Some(1.2),
        "fair" => Some(1.0),
        "poor" => Some(0.6),
        "closed" | "band closed" => Some(0.2),
        other => other
            .trim_end_matches('%')
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(numeric_modifier),
    }
}

fn numeric_modifier(value: f64) -> Option<f64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let value = if value > 1.0 { value / 100.0 } else { value };
    Some(0.2 + value.min(1.0))
}

fn value_modifier(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => level_modifier(s),
        Value::Number(n) => n.as_f64().and_then(numeric_modifier),
        _ => None,
    }
}

fn parse_time(text: &str) -> Option<TimeOfDay> {
    match text.trim().to_ascii_lowercase().as_str() {
        "day" => Some(TimeOfDay::Day),
        "night" => Some(TimeOfDay::Night),
        _ => None,
    }
}

/// Bands named by a feed label: a single band ("20m") or a span ("80m-40m").
/// Span ends outside our table (e.g. 12m) still bound the span.
pub fn expand_band_span(label: &str) -> Vec<Band> {
    let meters = |s: &str| -> Option<u16> {
        let s = s.trim().to_ascii_lowercase();
        s.strip_suffix('m').unwrap_or(&s).trim().parse().ok()
    };

    let (low, high) = match label.split_once('-') {
        Some((a, b)) => match (meters(a), meters(b)) {
            (Some(a), Some(b)) => (a.min(b), a.max(b)),
            _ => return Vec::new(),
        },
        None => match meters(label) {
            Some(m) => (m, m),
            None => return Vec::new(),
        },
    };

    Band::ALL
        .iter()
        .copied()
        .filter(|band| (low..=high).contains(&band.meters()))
        .collect()
}

fn push_conditions(out: &mut Vec<BandCondition>, label: &str, time: Option<TimeOfDay>, modifier: f64) {
    for band in expand_band_span(label) {
        out.push(BandCondition { band, time, modifier });
    }
}

/// Parse a band conditions payload (JSON or hamqsl XML).
pub fn parse_band_conditions(payload: &[u8]) -> Result<Vec<BandCondition>> {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim_start();

    let conditions = if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| PropagationError::Parse(format!("band conditions JSON: {}", e)))?;
        let mut conditions = Vec::new();
        collect_json_conditions(&value, &mut conditions);
        conditions
    } else {
        parse_band_conditions_xml(trimmed)?
    };

    if conditions.is_empty() {
        return Err(PropagationError::Parse("no band conditions in payload".to_string()));
    }
    Ok(conditions)
}

fn collect_json_conditions(value: &Value, out: &mut Vec<BandCondition>) {
    match value {
        Value::Array(entries) => {
            for entry in entries {
                if let Some(object) = entry.as_object() {
                    collect_json_entry(object, out);
                }
            }
        }
        Value::Object(map) => {
            if let Some(bands) = map.get("bands") {
                collect_json_conditions(bands, out);
                return;
            }
            if BAND_KEYS.iter().any(|key| map.contains_key(*key)) {
                collect_json_entry(map, out);
                return;
            }
            // Plain map of band label -> level, or label -> {day, night}
            for (label, level) in map {
                match level {
                    Value::Object(halves) => {
                        for (key, time) in [("day", TimeOfDay::Day), ("night", TimeOfDay::Night)] {
                            if let Some(modifier) = halves.get(key).and_then(value_modifier) {
                                push_conditions(out, label, Some(time), modifier);
                            }
                        }
                    }
                    other => match value_modifier(other) {
                        Some(modifier) => push_conditions(out, label, None, modifier),
                        None => warn!("Ignoring band level for {}: {}", label, other),
                    },
                }
            }
        }
        _ => {}
    }
}

fn collect_json_entry(object: &serde_json::Map<String, Value>, out: &mut Vec<BandCondition>) {
    let label = BAND_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str));
    let modifier = LEVEL_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(value_modifier));
    let time = object.get("time").and_then(Value::as_str).and_then(parse_time);

    match (label, modifier) {
        (Some(label), Some(modifier)) => push_conditions(out, label, time, modifier),
        _ => warn!("Skipping malformed band entry: {:?}", object),
    }
}

fn parse_band_conditions_xml(xml: &str) -> Result<Vec<BandCondition>> {
    let document = Html::parse_document(xml);
    let band_sel = Selector::parse("band")
        .map_err(|e| PropagationError::Parse(format!("selector error: {}", e)))?;

    let mut conditions = Vec::new();
    for element in document.select(&band_sel) {
        let Some(label) = element.value().attr("name") else {
            continue;
        };
        let time = element.value().attr("time").and_then(parse_time);
        let level = element.text().collect::<String>();

        match level_modifier(&level) {
            Some(modifier) => push_conditions(&mut conditions, label, time, modifier),
            None => warn!("Unknown band level {:?} for {}", level.trim(), label),
        }
    }

    Ok(conditions)
}

/// Finite numeric reading; "NaN" and "inf" strings parse as f64 but are not readings
fn value_as_f64(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    v.filter(|v| v.is_finite())
}

fn header_position(header: &[Value], pred: impl Fn(&str) -> bool) -> Option<usize> {
    header
        .iter()
        .position(|h| h.as_str().is_some_and(|name| pred(name)))
}

/// Newest value of the first matching column in a SWPC product.
///
/// Records are ordered by `time_tag` (ISO-8601 strings sort chronologically);
/// records without a readable value are skipped.
fn newest_swpc_value(payload: &[u8], keys: &[&str], product: &str) -> Result<f64> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| PropagationError::Parse(format!("{} JSON: {}", product, e)))?;
    let rows = value
        .as_array()
        .ok_or_else(|| PropagationError::Parse(format!("{}: expected an array", product)))?;

    let matches_key = |name: &str| keys.iter().any(|key| name.eq_ignore_ascii_case(key));
    let mut records: Vec<(Option<String>, f64)> = Vec::new();

    match rows.first() {
        Some(Value::Array(header)) => {
            let value_col = header_position(header, matches_key)
                .ok_or_else(|| PropagationError::Parse(format!("{}: no value column", product)))?;
            let time_col = header_position(header, |name| name.eq_ignore_ascii_case("time_tag"));

            for row in rows.iter().skip(1).filter_map(Value::as_array) {
                if let Some(v) = row.get(value_col).and_then(value_as_f64) {
                    let tag = time_col
                        .and_then(|col| row.get(col))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    records.push((tag, v));
                }
            }
        }
        _ => {
            for object in rows.iter().filter_map(Value::as_object) {
                // f107_cm_flux.json also lists other frequencies on some days
                if let Some(freq) = object.get("frequency").and_then(value_as_f64) {
                    if (freq - 2800.0).abs() > 1.0 {
                        continue;
                    }
                }
                let v = object
                    .iter()
                    .find(|(name, _)| matches_key(name.as_str()))
                    .and_then(|(_, v)| value_as_f64(v));
                if let Some(v) = v {
                    let tag = object.get("time_tag").and_then(Value::as_str).map(str::to_string);
                    records.push((tag, v));
                }
            }
        }
    }

    records
        .into_iter()
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, v)| v)
        .ok_or_else(|| PropagationError::Parse(format!("{}: no usable records", product)))
}

/// Latest 10.7 cm solar flux from the SWPC flux product.
pub fn parse_solar_flux(payload: &[u8]) -> Result<f64> {
    newest_swpc_value(payload, &FLUX_KEYS, "solar flux")
}

/// Latest planetary K-index from the SWPC K-index product.
pub fn parse_k_index(payload: &[u8]) -> Result<f64> {
    newest_swpc_value(payload, &KP_KEYS, "K-index")
}
