//! Request templates and reply classification per device model
//!
//! The registry maps model strings (e.g. `zhimi.airmonitor.v1`) to the JSON
//! request templates and property lists used to query them. A `"*"` entry
//! supplies defaults for models without an explicit section; lookups resolve
//! the exact model first and fall back to `"*"`.
//!
//! Templates contain literal `#` markers: the run after `"id":` is replaced
//! with the request id at send time, the run after `"params":` with the
//! JSON-encoded parameter list when the template is resolved.

use log::warn;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

pub const DEFAULT_MIIO_INFO_REQUEST: &str = r#"{"method":"miIO.info","params":[],"id":#}"#;
pub const DEFAULT_GET_PROP_REQUEST: &str = r#"{"method":"get_prop","params":#,"id":#}"#;

const WILDCARD: &str = "*";
const ID_KEY: &str = "\"id\":";
const PARAMS_KEY: &str = "\"params\":";

/// Per-model request configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Model {
    #[serde(rename = "Methods", default)]
    pub methods: ModelMethods,
    #[serde(rename = "Params", default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelMethods {
    #[serde(rename = "MiioInfo", default)]
    pub miio_info: String,
    #[serde(rename = "GetProp", default)]
    pub get_prop: String,
}

/// Registry of model configurations with `"*"` defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct Models(HashMap<String, Model>);

impl Default for Models {
    fn default() -> Models {
        let mut models = Models(HashMap::new());
        models.ensure_defaults();
        models
    }
}

impl Models {
    /// Insert the stock `"*"` entry if the configuration did not provide one
    pub fn ensure_defaults(&mut self) {
        self.0.entry(WILDCARD.to_string()).or_insert_with(|| Model {
            methods: ModelMethods {
                miio_info: DEFAULT_MIIO_INFO_REQUEST.to_string(),
                get_prop: DEFAULT_GET_PROP_REQUEST.to_string(),
            },
            params: vec!["all".to_string()],
        });
    }

    pub fn insert(&mut self, name: &str, model: Model) {
        self.0.insert(name.to_string(), model);
    }

    /// miIO.info request template for a model, `""` when unknown
    pub fn miio_info(&self, model: &str) -> String {
        for name in [model, WILDCARD] {
            if let Some(m) = self.0.get(name) {
                if !m.methods.miio_info.is_empty() {
                    return m.methods.miio_info.clone();
                }
            }
        }
        warn!("unable to find {} miIO.info request", model);
        String::new()
    }

    /// Ordered property list for a model; empty names are filtered out
    pub fn params(&self, model: &str) -> Vec<String> {
        for name in [model, WILDCARD] {
            if let Some(m) = self.0.get(name) {
                let params: Vec<String> =
                    m.params.iter().filter(|p| !p.is_empty()).cloned().collect();
                if !params.is_empty() {
                    return params;
                }
            }
        }
        warn!("unable to find {} parameters list", model);
        Vec::new()
    }

    /// get_prop request template with the parameter list substituted in,
    /// `""` when the template or the parameters are unknown
    pub fn get_prop(&self, model: &str) -> String {
        let mut template = String::new();
        for name in [model, WILDCARD] {
            if let Some(m) = self.0.get(name) {
                if !m.methods.get_prop.is_empty() {
                    template = m.methods.get_prop.clone();
                    break;
                }
            }
        }
        if template.is_empty() {
            warn!("unable to find {} get_prop request", model);
            return String::new();
        }
        let params = self.params(model);
        if params.is_empty() {
            return String::new();
        }
        match serde_json::to_string(&params) {
            Ok(encoded) => patch_template(&template, PARAMS_KEY, &encoded),
            Err(err) => {
                warn!("invalid {} request parameters {:?}: {}", model, params, err);
                String::new()
            }
        }
    }
}

/// Replace every `#` run following `key` with `value`
///
/// A single optional space is tolerated between the key and the marker, the
/// way hand-written templates sometimes format them.
pub(crate) fn patch_template(template: &str, key: &str, value: &str) -> String {
    let bytes = template.as_bytes();
    let key_bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + value.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(key_bytes) {
            out.extend_from_slice(key_bytes);
            i += key_bytes.len();
            if i < bytes.len() && bytes[i] == b' ' {
                out.push(b' ');
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'#' {
                while i < bytes.len() && bytes[i] == b'#' {
                    i += 1;
                }
                out.extend_from_slice(value.as_bytes());
            }
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    // Splits only happen at ASCII key matches, so the bytes stay valid UTF-8.
    String::from_utf8(out).unwrap_or_else(|_| template.to_string())
}

/// Classified device reply payload
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    MiioInfo { model: String },
    GetProp { props: Vec<Value> },
    Unrecognized,
}

#[derive(Debug, Default, Deserialize)]
struct InfoReply {
    #[serde(default)]
    result: InfoResult,
}

#[derive(Debug, Default, Deserialize)]
struct InfoResult {
    #[serde(default)]
    model: String,
}

#[derive(Debug, Default, Deserialize)]
struct PropReply {
    #[serde(default)]
    result: Vec<Value>,
}

/// Classify a decrypted reply payload
///
/// An object-valued `result` with a non-empty `model` is a miIO.info reply; a
/// non-empty array-valued `result` is a get_prop reply. Anything else is
/// unrecognized and logged by the caller.
pub fn parse_reply(data: &[u8]) -> Reply {
    if let Ok(info) = serde_json::from_slice::<InfoReply>(data) {
        if !info.result.model.is_empty() {
            return Reply::MiioInfo {
                model: info.result.model,
            };
        }
    }
    if let Ok(props) = serde_json::from_slice::<PropReply>(data) {
        if !props.result.is_empty() {
            return Reply::GetProp {
                props: props.result,
            };
        }
    }
    Reply::Unrecognized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_registry_templates() {
        let models = Models::default();
        assert_eq!(models.miio_info("zhimi.airmonitor.v1"), DEFAULT_MIIO_INFO_REQUEST);
        assert_eq!(models.miio_info("*"), DEFAULT_MIIO_INFO_REQUEST);
        assert_eq!(
            models.get_prop("unknown.model"),
            r#"{"method":"get_prop","params":["all"],"id":#}"#
        );
    }

    #[test]
    fn test_model_overrides_wildcard() {
        let mut models = Models::default();
        models.insert(
            "zhimi.airmonitor.v1",
            Model {
                methods: ModelMethods::default(),
                params: vec![
                    "power".to_string(),
                    "usb_state".to_string(),
                    "aqi".to_string(),
                    "battery".to_string(),
                ],
            },
        );
        assert_eq!(
            models.params("zhimi.airmonitor.v1"),
            vec!["power", "usb_state", "aqi", "battery"]
        );
        // Template comes from "*", parameters from the model entry.
        assert_eq!(
            models.get_prop("zhimi.airmonitor.v1"),
            r#"{"method":"get_prop","params":["power","usb_state","aqi","battery"],"id":#}"#
        );
    }

    #[test]
    fn test_params_filters_empty_entries() {
        let mut models = Models::default();
        models.insert(
            "test.model",
            Model {
                methods: ModelMethods::default(),
                params: vec!["power".to_string(), String::new(), "battery".to_string()],
            },
        );
        assert_eq!(models.params("test.model"), vec!["power", "battery"]);
    }

    #[test]
    fn test_empty_registry_lookups() {
        let models = Models(HashMap::new());
        assert_eq!(models.miio_info("any"), "");
        assert!(models.params("any").is_empty());
        assert_eq!(models.get_prop("any"), "");
    }

    #[test]
    fn test_patch_template() {
        assert_eq!(
            patch_template(r#"{"method":"get_prop","params":#,"id":#}"#, "\"params\":", r#"["power","battery"]"#),
            r#"{"method":"get_prop","params":["power","battery"],"id":#}"#
        );
        assert_eq!(
            patch_template(r#"{"params":["all"],"id":####}"#, "\"id\":", "7"),
            r#"{"params":["all"],"id":7}"#
        );
        // An optional single space between key and marker is preserved.
        assert_eq!(
            patch_template(r#"{"id": #}"#, "\"id\":", "42"),
            r#"{"id": 42}"#
        );
        // No marker after the key leaves the template untouched.
        assert_eq!(
            patch_template(r#"{"id":5}"#, "\"id\":", "42"),
            r#"{"id":5}"#
        );
    }

    #[test]
    fn test_parse_info_reply() {
        let reply = parse_reply(
            br#"{"result":{"model":"zhimi.airmonitor.v1","fw_ver":"1.2.4_49"},"id":1}"#,
        );
        assert_eq!(
            reply,
            Reply::MiioInfo {
                model: "zhimi.airmonitor.v1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_get_prop_reply() {
        let reply = parse_reply(br#"{"result":["on","on",4,100,"off","on"],"id":1}"#);
        assert_eq!(
            reply,
            Reply::GetProp {
                props: vec![json!("on"), json!("on"), json!(4), json!(100), json!("off"), json!("on")]
            }
        );
    }

    #[test]
    fn test_parse_unrecognized_reply() {
        assert_eq!(parse_reply(b"not json"), Reply::Unrecognized);
        assert_eq!(parse_reply(br#"{"error":{"code":-1}}"#), Reply::Unrecognized);
        assert_eq!(parse_reply(br#"{"result":[],"id":1}"#), Reply::Unrecognized);
        assert_eq!(parse_reply(br#"{"result":{"model":""},"id":1}"#), Reply::Unrecognized);
    }
}
