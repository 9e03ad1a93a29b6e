//! Property name filters (exact names and anchored regex patterns).

use crate::error::{BridgeError, Result};
use crate::state::merge::Properties;
use log::warn;
use regex::Regex;
use std::collections::HashSet;

/// Characters that turn an entry into a pattern instead of an exact name.
const PATTERN_CHARS: &[char] = &[
    '.', '*', '+', '?', '[', ']', '(', ')', '{', '}', '|', '^', '$', '\\',
];

/// Matches top-level property names against exact names and patterns.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    exact: HashSet<String>,
    patterns: Vec<Regex>,
}

impl KeyFilter {
    /// Build a filter, failing on the first invalid pattern.
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for entry in entries {
            filter.push(entry.as_ref())?;
        }
        Ok(filter)
    }

    /// Build a filter, skipping invalid patterns with a warning.
    pub fn lossy<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for entry in entries {
            if let Err(e) = filter.push(entry.as_ref()) {
                warn!("[Filter] Ignoring entry: {}", e);
            }
        }
        filter
    }

    fn push(&mut self, entry: &str) -> Result<()> {
        if entry.contains(PATTERN_CHARS) {
            let anchored = format!("^(?:{})$", entry);
            let regex = Regex::new(&anchored).map_err(|source| BridgeError::InvalidPattern {
                pattern: entry.to_string(),
                source,
            })?;
            self.patterns.push(regex);
        } else {
            self.exact.insert(entry.to_string());
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }

    pub fn matches(&self, key: &str) -> bool {
        self.exact.contains(key) || self.patterns.iter().any(|p| p.is_match(key))
    }

    /// Remove every matching top-level key.
    pub fn strip(&self, properties: &mut Properties) {
        if self.is_empty() {
            return;
        }
        properties.retain(|key, _| !self.matches(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_and_pattern_entries() {
        let filter = KeyFilter::new(["action", "action_.*", "button"]).unwrap();
        assert!(filter.matches("action"));
        assert!(filter.matches("action_group"));
        assert!(filter.matches("button"));
        assert!(!filter.matches("button_left"));
        assert!(!filter.matches("my_action_x"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            KeyFilter::new(["valid", "broken(["]),
            Err(BridgeError::InvalidPattern { .. })
        ));
        let lossy = KeyFilter::lossy(["valid", "broken(["]);
        assert!(lossy.matches("valid"));
    }

    #[test]
    fn test_strip_top_level() {
        let filter = KeyFilter::new(["action", "elapsed"]).unwrap();
        let mut props = json!({"action": "single", "temperature": 21.5, "elapsed": 120})
            .as_object()
            .cloned()
            .unwrap();
        filter.strip(&mut props);
        assert_eq!(serde_json::Value::Object(props), json!({"temperature": 21.5}));
    }
}
