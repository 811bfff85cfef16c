//! Helpers shared by the built-in extensions.

use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use hearth_core::extension::{ExtensionError, ExtensionServices, Result};

/// Decode a configuration document, reporting failures as validation errors.
pub(crate) fn parse_config<T: DeserializeOwned>(extension: &str, config: &Value) -> Result<T> {
    let config = if config.is_null() { json!({}) } else { config.clone() };
    serde_json::from_value(config).map_err(|e| ExtensionError::ConfigValidation {
        extension: extension.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn invalid_config(extension: &str, message: impl Into<String>) -> ExtensionError {
    ExtensionError::ConfigValidation {
        extension: extension.to_string(),
        message: message.into(),
    }
}

/// Services captured at initialize, or a registration error if absent.
pub(crate) fn require_services<'a>(
    extension: &str,
    services: &'a Option<ExtensionServices>,
) -> Result<&'a ExtensionServices> {
    services.as_ref().ok_or_else(|| ExtensionError::Registration {
        extension: extension.to_string(),
        message: "contributions requested before initialize".to_string(),
    })
}

/// UTC timestamp that sorts lexically.
pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Success envelope used by extension routes.
pub(crate) fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Default)]
    #[serde(default, deny_unknown_fields)]
    struct Sample {
        limit: u32,
    }

    #[test]
    fn test_parse_config_null_is_empty_object() {
        let sample: Sample = parse_config("x", &Value::Null).unwrap();
        assert_eq!(sample.limit, 0);
    }

    #[test]
    fn test_parse_config_reports_validation_error() {
        let err = parse_config::<Sample>("x", &json!({ "limit": "many" })).unwrap_err();
        assert!(matches!(err, ExtensionError::ConfigValidation { .. }));
    }

    #[test]
    fn test_timestamps_sort() {
        let a = timestamp();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timestamp() > a);
    }
}
