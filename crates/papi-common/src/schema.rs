//! User-config schemas for deployable workloads
//!
//! Each workload kind carries a schema grouping its parameters under
//! top-level sections (`general`, `hardware`, `storage`, plus
//! workload-specific ones). Every parameter declares a human label, a
//! default value, and optionally a closed option set, a numeric range and a
//! help text. The schema is what the dashboard renders, and what submitted
//! configurations are merged into and validated against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// One user-facing parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Human label shown by the dashboard
    pub name: String,
    /// Default value
    pub value: Value,
    /// Closed set of accepted values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
    /// Inclusive numeric range `[min, max]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[f64; 2]>,
    /// Help text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A workload's full parameter schema, grouped by section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfSchema {
    /// section -> parameter key -> spec
    pub groups: BTreeMap<String, BTreeMap<String, ParamSpec>>,
}

/// A concrete parameter assignment: section -> key -> value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserConf {
    /// section -> parameter key -> value
    pub groups: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ConfSchema {
    /// Parse a schema document, checking every parameter has a label and a
    /// default value
    pub fn from_yaml(raw: &str) -> Result<Self, String> {
        let schema: ConfSchema = serde_yaml::from_str(raw).map_err(|e| e.to_string())?;
        for (group, params) in &schema.groups {
            for (key, spec) in params {
                if spec.name.is_empty() {
                    return Err(format!("parameter {group}.{key} needs a name"));
                }
                if spec.value.is_null() && spec.options.is_none() {
                    return Err(format!("parameter {group}.{key} needs a value"));
                }
            }
        }
        Ok(schema)
    }

    /// Look up one parameter spec
    pub fn param(&self, group: &str, key: &str) -> Option<&ParamSpec> {
        self.groups.get(group)?.get(key)
    }

    /// Mutable access to one parameter spec (used when a catalog item
    /// pre-fills images, tags or per-VO limits)
    pub fn param_mut(&mut self, group: &str, key: &str) -> Option<&mut ParamSpec> {
        self.groups.get_mut(group)?.get_mut(key)
    }

    /// The default assignment for this schema
    pub fn default_values(&self) -> UserConf {
        let groups = self
            .groups
            .iter()
            .map(|(group, params)| {
                let values = params
                    .iter()
                    .map(|(key, spec)| (key.clone(), spec.value.clone()))
                    .collect();
                (group.clone(), values)
            })
            .collect();
        UserConf { groups }
    }

    /// Merge a submitted partial configuration over the defaults.
    ///
    /// Unknown sections or parameter keys are rejected with a pointer to
    /// the offending field.
    pub fn merge(&self, submitted: &Value) -> Result<UserConf, Error> {
        let mut conf = self.default_values();
        let Some(sections) = submitted.as_object() else {
            return Err(Error::bad_request("conf", "configuration must be an object"));
        };
        for (group, params) in sections {
            let Some(known) = conf.groups.get_mut(group) else {
                return Err(Error::bad_request(
                    group.clone(),
                    "unknown configuration section",
                ));
            };
            let Some(params) = params.as_object() else {
                return Err(Error::bad_request(
                    group.clone(),
                    "configuration section must be an object",
                ));
            };
            for (key, value) in params {
                if !known.contains_key(key) {
                    return Err(Error::bad_request(
                        format!("{group}.{key}"),
                        "unknown configuration parameter",
                    ));
                }
                known.insert(key.clone(), value.clone());
            }
        }
        Ok(conf)
    }

    /// Validate an assignment against option sets and ranges
    pub fn validate(&self, conf: &UserConf) -> Result<(), Error> {
        for (group, params) in &conf.groups {
            for (key, value) in params {
                let Some(spec) = self.param(group, key) else {
                    continue;
                };
                let field = format!("{group}.{key}");
                if let Some(options) = &spec.options {
                    if !options.contains(value) {
                        return Err(Error::bad_request(
                            field,
                            format!("value {value} is not one of the accepted options"),
                        ));
                    }
                }
                if let Some([min, max]) = spec.range {
                    let Some(number) = value.as_f64() else {
                        return Err(Error::bad_request(field, "value must be a number"));
                    };
                    if number < min {
                        return Err(Error::bad_request(
                            field,
                            format!("should be bigger or equal to {min}"),
                        ));
                    }
                    if number > max {
                        return Err(Error::bad_request(
                            field,
                            format!("should be smaller or equal to {max}"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

impl UserConf {
    /// String parameter, empty string if absent or not a string
    pub fn str(&self, group: &str, key: &str) -> &str {
        self.groups
            .get(group)
            .and_then(|g| g.get(key))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Unsigned parameter, 0 if absent or not a number
    pub fn u64(&self, group: &str, key: &str) -> u64 {
        self.groups
            .get(group)
            .and_then(|g| g.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Raw parameter value
    pub fn get(&self, group: &str, key: &str) -> Option<&Value> {
        self.groups.get(group)?.get(key)
    }

    /// Whether a section exists
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Set a value (used by controllers to force computed fields)
    pub fn set(&mut self, group: &str, key: &str, value: Value) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

/// Maximum accepted title length
pub const TITLE_MAX_CHARS: usize = 45;

/// Maximum accepted description length
pub const DESCRIPTION_MAX_CHARS: usize = 1000;

/// Minimum accepted IDE password length
pub const IDE_PASSWORD_MIN_CHARS: usize = 9;

/// Validate the deployment title length
pub fn validate_title(title: &str) -> Result<(), Error> {
    if title.chars().count() > TITLE_MAX_CHARS {
        return Err(Error::bad_request(
            "general.title",
            format!("title must be at most {TITLE_MAX_CHARS} characters"),
        ));
    }
    Ok(())
}

/// Validate the IDE password length
pub fn validate_ide_password(password: &str) -> Result<(), Error> {
    if password.chars().count() < IDE_PASSWORD_MIN_CHARS {
        return Err(Error::bad_request(
            "general.jupyter_password",
            format!("your IDE needs a password of at least {IDE_PASSWORD_MIN_CHARS} characters"),
        ));
    }
    Ok(())
}

/// Validate a user-requested hostname: ASCII alphanumerics and hyphens,
/// starting with an alphanumeric
pub fn validate_hostname(hostname: &str) -> Result<(), Error> {
    if hostname.is_empty() {
        return Ok(());
    }
    let valid = hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && hostname.starts_with(|c: char| c.is_ascii_alphanumeric());
    if !valid {
        return Err(Error::bad_request(
            "general.hostname",
            "hostname may only contain alphanumerics and hyphens",
        ));
    }
    Ok(())
}

/// Truncate a description to the accepted maximum
pub fn clamp_description(desc: &str) -> &str {
    match desc.char_indices().nth(DESCRIPTION_MAX_CHARS) {
        Some((idx, _)) => &desc[..idx],
        None => desc,
    }
}
