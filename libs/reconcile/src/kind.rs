//! Per-kind capabilities.
//!
//! Every resource kind shares one capability set: which fields the
//! differencer leaves alone, and how a specification is validated before the
//! live system accepts it. Kinds are matched as tagged variants.

use serde_json::Value;
use steward_id::ResourceKind;

use crate::document::{self, FieldPath};

/// Capabilities every resource kind provides to diff and apply.
pub trait KindCapabilities {
    /// Fields owned by the live system that are never diffed.
    fn ignored_fields(&self) -> Vec<FieldPath>;

    /// Validates a full specification. Returns a human-readable reason on rejection.
    fn validate(&self, spec: &Value) -> Result<(), String>;
}

impl KindCapabilities for ResourceKind {
    fn ignored_fields(&self) -> Vec<FieldPath> {
        let mut fields = vec![FieldPath::parse("status")];
        if matches!(self, ResourceKind::Service) {
            // Assigned by the live system on creation.
            fields.push(FieldPath::parse("spec.clusterIP"));
        }
        fields
    }

    fn validate(&self, spec: &Value) -> Result<(), String> {
        if !spec.is_object() {
            return Err(format!("{self} spec must be an object"));
        }

        match self {
            ResourceKind::Deployment => {
                if let Some(replicas) = document::get(spec, &"spec.replicas".into()) {
                    if replicas.as_u64().is_none() {
                        return Err(format!(
                            "spec.replicas must be a non-negative integer, got {replicas}"
                        ));
                    }
                }
                Ok(())
            }
            ResourceKind::Service => {
                let Some(ports) = document::get(spec, &"spec.ports".into()) else {
                    return Ok(());
                };
                let ports = ports
                    .as_array()
                    .ok_or_else(|| "spec.ports must be an array".to_string())?;
                for (i, port) in ports.iter().enumerate() {
                    let number = port.get("port").and_then(Value::as_u64);
                    if !matches!(number, Some(1..=65535)) {
                        return Err(format!("spec.ports[{i}].port must be in 1..=65535"));
                    }
                }
                Ok(())
            }
            ResourceKind::ConfigMap => {
                let Some(data) = spec.get("data") else {
                    return Ok(());
                };
                let data = data
                    .as_object()
                    .ok_or_else(|| "data must be an object".to_string())?;
                match data.iter().find(|(_, v)| !v.is_string()) {
                    Some((key, _)) => Err(format!("data.{key} must be a string")),
                    None => Ok(()),
                }
            }
            ResourceKind::Custom(_) => Ok(()),
        }
    }
}

/// Returns true if `path` falls under one of the `ignored` fields.
pub(crate) fn is_ignored(ignored: &[FieldPath], path: &FieldPath) -> bool {
    ignored.iter().any(|prefix| path.starts_with(prefix))
}
