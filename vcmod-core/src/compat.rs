//! Attribute aliases across server API versions.
//!
//! Newer servers dropped some attributes in favour of renamed ones. When a
//! normalised object lacks the old name but carries the new one, the old
//! name is filled from it so comparisons and results stay stable.

use serde_json::{Map, Value};

/// `(removed attribute, replacement attribute)`.
pub const ALIASES: &[(&str, &str)] = &[
    ("checkpointFtSupported", "smpFtSupported"),
    ("checkpointFtCompatibilityIssues", "smpFtCompatibilityIssues"),
];

/// Fill removed attributes of one object from their replacements.
pub fn apply(map: &mut Map<String, Value>) {
    for (removed, replacement) in ALIASES {
        if map.contains_key(*removed) {
            continue;
        }
        if let Some(v) = map.get(*replacement).cloned() {
            map.insert(removed.to_string(), v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fills_removed_attribute() {
        let mut caps = json!({ "smpFtSupported": true }).as_object().cloned().unwrap();
        apply(&mut caps);
        assert_eq!(caps["checkpointFtSupported"], true);

        let mut both = json!({ "checkpointFtSupported": false, "smpFtSupported": true })
            .as_object()
            .cloned()
            .unwrap();
        apply(&mut both);
        assert_eq!(both["checkpointFtSupported"], false);
    }
}
