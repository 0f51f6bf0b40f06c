//! Preset helpers
//!
//! Firmware presets are opaque strings. Two operations need to see
//! through them: the balancer derives a wattage from values like
//! `"1300"` or `"3010W"`, and the status sampler canonicalizes the
//! `current_preset` field, which the firmware returns as a bare string,
//! an object, or null depending on version.

use serde::Deserialize;
use serde_json::Value;

/// Parse an expected wattage out of a preset value.
///
/// A preset yields a wattage when, trimmed and lowercased, it is not
/// empty, not `"disabled"`, and parses as a positive number after an
/// optional trailing `w` is removed. Everything else has no wattage and
/// is excluded from balancing.
///
/// Handles both vendor formats: `"3010W"` (S21) and `"1300"` (S19).
pub fn parse_wattage(preset: &str) -> Option<f64> {
    let preset = preset.trim().to_lowercase();

    if preset.is_empty() || preset == "disabled" {
        return None;
    }

    let digits = preset.strip_suffix('w').unwrap_or(&preset);
    match digits.parse::<f64>() {
        Ok(watts) if watts > 0.0 => Some(watts),
        _ => None,
    }
}

/// Structured form of the `current_preset` payload.
#[derive(Debug, Deserialize, Default)]
struct StructuredPreset {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    preset: Option<String>,
    #[serde(default)]
    pretty: Option<String>,
}

/// Decode the firmware's `current_preset` JSON value into a canonical
/// preset string.
///
/// The payload drifts across firmware versions: it may be a plain
/// string, an object carrying any of `name`, `preset`, `pretty`, or
/// null. In the structured case the first non-empty field wins, in that
/// order. Returns `None` for null, unknown shapes, and empty strings.
pub fn decode_current_preset(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => non_empty(s),
        Value::Object(_) => {
            let structured: StructuredPreset =
                serde_json::from_value(raw.clone()).unwrap_or_default();
            structured
                .name
                .as_deref()
                .and_then(non_empty)
                .or_else(|| structured.preset.as_deref().and_then(non_empty))
                .or_else(|| structured.pretty.as_deref().and_then(non_empty))
        }
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wattage_with_suffix() {
        assert_eq!(parse_wattage("3010W"), Some(3010.0));
        assert_eq!(parse_wattage("3420w"), Some(3420.0));
    }

    #[test]
    fn test_parse_wattage_bare_number() {
        assert_eq!(parse_wattage("1100"), Some(1100.0));
        assert_eq!(parse_wattage(" 1300 "), Some(1300.0));
    }

    #[test]
    fn test_parse_wattage_round_trip() {
        // Any "<n>W" with n a positive integer parses to exactly n.
        for n in [1u32, 900, 1300, 3010, 6500] {
            assert_eq!(parse_wattage(&format!("{}W", n)), Some(f64::from(n)));
        }
    }

    #[test]
    fn test_parse_wattage_rejects_non_power_presets() {
        assert_eq!(parse_wattage(""), None);
        assert_eq!(parse_wattage("   "), None);
        assert_eq!(parse_wattage("disabled"), None);
        assert_eq!(parse_wattage("Disabled"), None);
        assert_eq!(parse_wattage("-100"), None);
        assert_eq!(parse_wattage("0"), None);
        assert_eq!(parse_wattage("turbo"), None);
    }

    #[test]
    fn test_decode_current_preset_string() {
        assert_eq!(
            decode_current_preset(&json!("1300")),
            Some("1300".to_string())
        );
        assert_eq!(decode_current_preset(&json!("")), None);
    }

    #[test]
    fn test_decode_current_preset_structured() {
        assert_eq!(
            decode_current_preset(&json!({"name": "1300", "pretty": "1300 W"})),
            Some("1300".to_string())
        );
        // First non-empty field wins: name, then preset, then pretty.
        assert_eq!(
            decode_current_preset(&json!({"name": "", "preset": "900", "pretty": "900 W"})),
            Some("900".to_string())
        );
        assert_eq!(
            decode_current_preset(&json!({"pretty": "eco mode"})),
            Some("eco mode".to_string())
        );
    }

    #[test]
    fn test_decode_current_preset_null_and_unknown() {
        assert_eq!(decode_current_preset(&json!(null)), None);
        assert_eq!(decode_current_preset(&json!(42)), None);
        assert_eq!(decode_current_preset(&json!({"other": "x"})), None);
    }
}
