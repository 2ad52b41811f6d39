//! Kubernetes quantity parsing for capacity columns.

use std::sync::OnceLock;

use regex::Regex;

const THOUSAND: f64 = 1_000.0;
const MILLION: f64 = THOUSAND * THOUSAND;
const BILLION: f64 = THOUSAND * MILLION;

fn quantity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9]+(?:\.[0-9]+)?)\s*([a-zA-Z]*)$").expect("quantity regex"))
}

fn split(q: &str) -> Option<(f64, &str)> {
    let caps = quantity_re().captures(q.trim())?;
    let num = caps.get(1)?.as_str().parse::<f64>().ok()?;
    let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    Some((num, unit))
}

/// CPU quantity in cores: `"250m"` → 0.25, `"2"` → 2.0, `"100n"` → 1e-7.
pub fn cpu_units_to_number(cpu: &str) -> Option<f64> {
    let (num, unit) = split(cpu)?;
    match unit {
        "" => Some(num),
        "m" => Some(num / THOUSAND),
        "u" => Some(num / MILLION),
        "n" => Some(num / BILLION),
        _ => None,
    }
}

/// Memory/storage quantity in bytes: binary (`Ki`..`Ei`) and decimal (`k`..`E`) suffixes.
pub fn units_to_bytes(value: &str) -> Option<f64> {
    let (num, unit) = split(value)?;
    let unit = unit.strip_suffix('B').unwrap_or(unit);
    let binary = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
    let decimal = ["k", "M", "G", "T", "P", "E"];
    if unit.is_empty() {
        return Some(num);
    }
    if let Some(pos) = binary.iter().position(|u| *u == unit) {
        return Some(num * 1024f64.powi(pos as i32 + 1));
    }
    if let Some(pos) = decimal.iter().position(|u| *u == unit || (unit == "K" && *u == "k")) {
        return Some(num * THOUSAND.powi(pos as i32 + 1));
    }
    None
}
