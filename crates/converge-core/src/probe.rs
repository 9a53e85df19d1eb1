//! Read-only status probes and their results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, ConfigResult};
use crate::exec::CommandSpec;
use crate::query::{extract, render_value, OutputFormat};

/// A named field to pull out of a probe's structured response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Label shown in the report.
    pub name: String,
    /// Dotted path into the response; defaults to `name`.
    pub path: String,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
        }
    }

    pub fn at(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// One status query against an external CLI or API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub name: String,
    pub query: CommandSpec,
    #[serde(default)]
    pub format: OutputFormat,
    /// Ordered; the report keeps this order.
    pub fields: Vec<FieldSpec>,
}

impl Probe {
    pub fn new(name: impl Into<String>, query: CommandSpec) -> Self {
        Self {
            name: name.into(),
            query,
            format: OutputFormat::Json,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName { kind: "probe" });
        }
        if self.query.program.trim().is_empty() {
            return Err(ConfigError::EmptyCommand {
                owner: self.name.clone(),
                role: "query",
            });
        }
        if self.fields.is_empty() {
            return Err(ConfigError::NoFields {
                probe: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Value of one field, or `unavailable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Value(String),
    Unavailable,
}

impl FieldValue {
    pub fn as_str(&self) -> &str {
        match self {
            FieldValue::Value(v) => v,
            FieldValue::Unavailable => "unavailable",
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, FieldValue::Value(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeField {
    pub name: String,
    pub value: FieldValue,
}

/// Outcome of one probe in one `status` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<ProbeField>,
    /// Why the query failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    /// Fill the probe's fields from a successful response. Fields missing
    /// from the response are `unavailable`.
    pub fn from_response(probe: &Probe, response: &Value) -> Self {
        let fields = probe
            .fields
            .iter()
            .map(|f| ProbeField {
                name: f.name.clone(),
                value: extract(response, &f.path)
                    .and_then(render_value)
                    .map(FieldValue::Value)
                    .unwrap_or(FieldValue::Unavailable),
            })
            .collect();
        Self {
            name: probe.name.clone(),
            timestamp: Utc::now(),
            fields,
            error: None,
        }
    }

    /// Every field `unavailable`, with the reason kept for diagnostics.
    pub fn unavailable(probe: &Probe, reason: impl Into<String>) -> Self {
        let fields = probe
            .fields
            .iter()
            .map(|f| ProbeField {
                name: f.name.clone(),
                value: FieldValue::Unavailable,
            })
            .collect();
        Self {
            name: probe.name.clone(),
            timestamp: Utc::now(),
            fields,
            error: Some(reason.into()),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == field).map(|f| &f.value)
    }

    pub fn is_available(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment_probe() -> Probe {
        Probe::new(
            "deployment",
            CommandSpec::new("aws", vec!["deploy".to_string(), "get-deployment".to_string()]),
        )
        .field(FieldSpec::at("status", "deploymentInfo.status"))
        .field(FieldSpec::at("canary", "deploymentInfo.traffic.canary"))
    }

    #[test]
    fn test_field_spec_defaults_path_to_name() {
        let f = FieldSpec::new("status");
        assert_eq!(f.path, "status");
    }

    #[test]
    fn test_from_response_extracts_in_declared_order() {
        let response = json!({"deploymentInfo": {"status": "Succeeded", "traffic": {"canary": 10}}});
        let result = ProbeResult::from_response(&deployment_probe(), &response);
        assert!(result.is_available());
        assert_eq!(result.fields[0].name, "status");
        assert_eq!(result.fields[0].value, FieldValue::Value("Succeeded".to_string()));
        assert_eq!(result.get("canary"), Some(&FieldValue::Value("10".to_string())));
    }

    #[test]
    fn test_missing_field_is_unavailable_without_error() {
        let response = json!({"deploymentInfo": {"status": "InProgress"}});
        let result = ProbeResult::from_response(&deployment_probe(), &response);
        assert!(result.error.is_none());
        assert_eq!(result.get("canary"), Some(&FieldValue::Unavailable));
    }

    #[test]
    fn test_unavailable_marks_every_field() {
        let result = ProbeResult::unavailable(&deployment_probe(), "no data");
        assert_eq!(result.fields.len(), 2);
        assert!(result.fields.iter().all(|f| !f.value.is_available()));
        assert_eq!(result.error.as_deref(), Some("no data"));
    }

    #[test]
    fn test_validate_requires_fields() {
        let probe = Probe::new("alarms", CommandSpec::new("aws", vec![]));
        assert!(matches!(probe.validate(), Err(ConfigError::NoFields { .. })));
    }

    #[test]
    fn test_field_value_serializes_as_plain_or_null() {
        assert_eq!(
            serde_json::to_value(FieldValue::Value("ok".to_string())).unwrap(),
            json!("ok")
        );
        assert_eq!(serde_json::to_value(FieldValue::Unavailable).unwrap(), json!(null));
    }
}
