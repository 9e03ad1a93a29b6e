//! Deep merge of JSON property maps.
//!
//! Nested objects merge key by key, scalars and arrays replace. `null` is the
//! tombstone: applying it to a state removes the key, merging it into another
//! patch keeps it so the removal survives until the patch is applied.

use serde_json::{Map, Value};

/// A property map: device state or a partial update of it.
pub type Properties = Map<String, Value>;

/// Apply `patch` on top of `state`, honouring tombstones.
pub fn apply(state: &mut Properties, patch: &Properties) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                state.remove(key);
            }
            Value::Object(nested) => match state.get_mut(key) {
                Some(Value::Object(existing)) => apply(existing, nested),
                _ => {
                    let mut fresh = Properties::new();
                    apply(&mut fresh, nested);
                    state.insert(key.clone(), Value::Object(fresh));
                }
            },
            other => {
                state.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Apply `patch` to a copy of `state`.
pub fn applied(state: &Properties, patch: &Properties) -> Properties {
    let mut merged = state.clone();
    apply(&mut merged, patch);
    merged
}

/// Merge a newer patch into an accumulated one, keeping tombstones.
pub fn merge_patch(target: &mut Properties, newer: &Properties) {
    for (key, value) in newer {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => merge_patch(existing, nested),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_nested_objects_merge_key_wise() {
        let mut state = props(json!({"color": {"x": 0.1, "y": 0.2}, "state": "ON"}));
        apply(&mut state, &props(json!({"color": {"y": 0.3}})));
        assert_eq!(
            Value::Object(state),
            json!({"color": {"x": 0.1, "y": 0.3}, "state": "ON"})
        );
    }

    #[test]
    fn test_arrays_and_scalars_replace() {
        let mut state = props(json!({"scenes": [1, 2, 3], "brightness": 10}));
        apply(&mut state, &props(json!({"scenes": [4], "brightness": 200})));
        assert_eq!(Value::Object(state), json!({"scenes": [4], "brightness": 200}));
    }

    #[test]
    fn test_tombstone_removes_on_apply() {
        let mut state = props(json!({"color": {"x": 0.1, "y": 0.2}, "state": "ON"}));
        apply(&mut state, &props(json!({"state": null, "color": {"x": null}})));
        assert_eq!(Value::Object(state), json!({"color": {"y": 0.2}}));
    }

    #[test]
    fn test_tombstone_in_fresh_nested_object_is_dropped() {
        let mut state = Properties::new();
        apply(&mut state, &props(json!({"color": {"x": null, "y": 1}})));
        assert_eq!(Value::Object(state), json!({"color": {"y": 1}}));
    }

    #[test]
    fn test_merge_patch_keeps_tombstones() {
        let mut pending = props(json!({"state": "ON", "color": {"x": 0.1}}));
        merge_patch(&mut pending, &props(json!({"state": null, "color": {"y": 0.5}})));
        assert_eq!(
            Value::Object(pending.clone()),
            json!({"state": null, "color": {"x": 0.1, "y": 0.5}})
        );

        let state = props(json!({"state": "OFF", "linkquality": 90}));
        assert_eq!(
            Value::Object(applied(&state, &pending)),
            json!({"linkquality": 90, "color": {"x": 0.1, "y": 0.5}})
        );
    }
}
