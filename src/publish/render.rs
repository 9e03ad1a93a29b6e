//! Payload rendering helpers: decimal precision and `last_seen`.

use crate::options::{EntitySettings, LastSeenMode};
use crate::state::Properties;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde_json::{Number, Value};

/// Decides how many decimals a measurement is published with.
pub trait PrecisionPolicy: Send + Sync {
    fn digits(&self, settings: &EntitySettings, key: &str) -> Option<u32>;
}

/// Reads `<measurement>_precision` from the entity options.
pub struct ConfiguredPrecision;

impl PrecisionPolicy for ConfiguredPrecision {
    fn digits(&self, settings: &EntitySettings, key: &str) -> Option<u32> {
        settings.precision_for(key)
    }
}

pub fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

/// Round every top-level float the policy has a precision for.
pub fn apply_precision(
    payload: &mut Properties,
    settings: &EntitySettings,
    policy: &dyn PrecisionPolicy,
) {
    for (key, value) in payload.iter_mut() {
        if !value.is_f64() {
            continue;
        }
        let Some(number) = value.as_f64() else {
            continue;
        };
        let Some(digits) = policy.digits(settings, key) else {
            continue;
        };

        let rounded = round_to(number, digits);
        *value = if digits == 0 && rounded.abs() < i64::MAX as f64 {
            Value::from(rounded as i64)
        } else {
            Number::from_f64(rounded).map(Value::Number).unwrap_or(Value::Null)
        };
    }
}

/// Render `at` for the configured mode; `None` when disabled.
pub fn last_seen_value(mode: LastSeenMode, at: DateTime<Utc>) -> Option<Value> {
    match mode {
        LastSeenMode::Disable => None,
        LastSeenMode::Epoch => Some(Value::from(at.timestamp_millis())),
        LastSeenMode::Iso8601 => Some(Value::from(
            at.to_rfc3339_opts(SecondsFormat::Millis, true),
        )),
        LastSeenMode::Iso8601Local => Some(Value::from(
            at.with_timezone(&Local)
                .to_rfc3339_opts(SecondsFormat::Millis, false),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DeviceOptions, EntityOptions};
    use chrono::TimeZone;
    use serde_json::json;

    fn settings_with(extra: Value) -> std::sync::Arc<EntitySettings> {
        let options = DeviceOptions::default();
        let mut entity = EntityOptions::default();
        for (k, v) in extra.as_object().unwrap() {
            entity.extra.insert(k.clone(), v.clone());
        }
        options.set_entity("sensor", entity);
        options.get("sensor")
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(21.456, 1), 21.5);
        assert_eq!(round_to(21.444, 2), 21.44);
        assert_eq!(round_to(-3.75, 0), -4.0);
    }

    #[test]
    fn test_apply_precision_only_configured_floats() {
        let settings = settings_with(json!({"temperature_precision": 1, "humidity_precision": 0}));
        let mut payload = json!({
            "temperature": 21.456,
            "humidity": 45.61,
            "pressure": 1013.27,
            "linkquality": 120
        })
        .as_object()
        .cloned()
        .unwrap();

        apply_precision(&mut payload, &settings, &ConfiguredPrecision);
        assert_eq!(
            Value::Object(payload),
            json!({"temperature": 21.5, "humidity": 46, "pressure": 1013.27, "linkquality": 120})
        );
    }

    #[test]
    fn test_last_seen_modes() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        assert_eq!(last_seen_value(LastSeenMode::Disable, at), None);
        assert_eq!(
            last_seen_value(LastSeenMode::Epoch, at),
            Some(json!(1714557600000i64))
        );
        assert_eq!(
            last_seen_value(LastSeenMode::Iso8601, at),
            Some(json!("2024-05-01T10:00:00.000Z"))
        );

        let local = last_seen_value(LastSeenMode::Iso8601Local, at).unwrap();
        let parsed = DateTime::parse_from_rfc3339(local.as_str().unwrap()).unwrap();
        assert_eq!(parsed.with_timezone(&Utc), at);
    }
}
