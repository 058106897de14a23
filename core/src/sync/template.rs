// Request body rendering
//
// A post template is any JSON value. Every string of the form "@field" is
// replaced by that field of the sample, recursively through objects and
// arrays. Unknown "@" tokens and all other values are copied unchanged.

use crate::location::LocationSample;
use serde_json::{Map, Value};

/// Fields of the body object when no template is configured
pub const DEFAULT_FIELDS: [&str; 10] = [
    "id",
    "provider",
    "locationProvider",
    "time",
    "latitude",
    "longitude",
    "accuracy",
    "speed",
    "altitude",
    "bearing",
];

/// Render one sample through `template` (or the default shape)
pub fn render_location(sample: &LocationSample, template: Option<&Value>) -> Value {
    let fields = sample.to_json();
    match template {
        Some(template) => substitute(template, &fields),
        None => {
            let object: Map<String, Value> = DEFAULT_FIELDS
                .iter()
                .map(|name| {
                    let value = fields.get(*name).cloned().unwrap_or(Value::Null);
                    (name.to_string(), value)
                })
                .collect();
            Value::Object(object)
        }
    }
}

/// JSON array body for a batch
pub fn render_batch(samples: &[LocationSample], template: Option<&Value>) -> String {
    let items: Vec<Value> = samples
        .iter()
        .map(|sample| render_location(sample, template))
        .collect();
    Value::Array(items).to_string()
}

fn substitute(template: &Value, fields: &Map<String, Value>) -> Value {
    match template {
        Value::String(text) => match text.strip_prefix('@').and_then(|name| fields.get(name)) {
            Some(value) => value.clone(),
            None => template.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|item| substitute(item, fields)).collect()),
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(key, value)| (key.clone(), substitute(value, fields)))
                .collect(),
        ),
        _ => template.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{Location, SyncStatus};
    use serde_json::json;

    fn sample() -> LocationSample {
        let mut location = Location::new("gps", 1_700_000_000_000, 52.5, 13.4).with_accuracy(12.0);
        location.speed = Some(3.5);
        LocationSample {
            id: 42,
            location,
            status: SyncStatus::Pending,
        }
    }

    #[test]
    fn test_default_shape() {
        let rendered = render_location(&sample(), None);
        let object = rendered.as_object().unwrap();
        assert_eq!(object.len(), DEFAULT_FIELDS.len());
        assert_eq!(rendered["id"], 42);
        assert_eq!(rendered["provider"], "gps");
        assert_eq!(rendered["speed"], 3.5);
        assert!(rendered["bearing"].is_null());
        assert!(object.get("status").is_none());
    }

    #[test]
    fn test_template_substitution() {
        let template = json!({
            "lat": "@latitude",
            "lon": "@longitude",
            "meta": { "acc": "@accuracy", "tags": ["@provider", "fixed"] },
            "unknown": "@altitude_agl",
            "plain": "@",
            "n": 5
        });
        let rendered = render_location(&sample(), Some(&template));
        assert_eq!(rendered["lat"], 52.5);
        assert_eq!(rendered["lon"], 13.4);
        assert_eq!(rendered["meta"]["acc"], 12.0);
        assert_eq!(rendered["meta"]["tags"], json!(["gps", "fixed"]));
        assert_eq!(rendered["unknown"], "@altitude_agl");
        assert_eq!(rendered["plain"], "@");
        assert_eq!(rendered["n"], 5);
    }

    #[test]
    fn test_array_template_and_batch() {
        let template = json!(["@latitude", "@longitude", "@time"]);
        let mut second = sample();
        second.id = 43;
        let body = render_batch(&[sample(), second], Some(&template));
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[1], json!([52.5, 13.4, 1_700_000_000_000u64]));
    }
}
