//! Pipeline Template Renderer.
//!
//! A pure function over declared variables: same `(template, variables)`
//! always yields byte-identical output. The substitution engine is
//! deliberately trivial — `{{var}}` token replacement — favoring
//! trivially reviewable substitution semantics over a full templating
//! engine.

pub mod builtin;

use crate::model::{PipelineTemplate, VariableSchema, VariableType};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("undeclared variable referenced in template body: {0}")]
    UndeclaredVariable(String),
    #[error("variable {name} expected type {expected:?}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: VariableType,
        actual: String,
    },
    #[error("missing required variable: {0}")]
    MissingVariable(String),
    #[error("render syntax error: {0}")]
    RenderSyntaxError(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// Implicit context variables the platform injects into every render:
/// `EXPERIMENT_ID`, `VARIANT`, `HOST_ID`, plus the metrics sink
/// address.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub experiment_id: String,
    pub variant: String,
    pub host_id: String,
    pub metrics_sink_addr: String,
}

impl RenderContext {
    fn as_map(&self) -> HashMap<String, Value> {
        let mut m = HashMap::new();
        m.insert("EXPERIMENT_ID".to_string(), Value::String(self.experiment_id.clone()));
        m.insert("VARIANT".to_string(), Value::String(self.variant.clone()));
        m.insert("HOST_ID".to_string(), Value::String(self.host_id.clone()));
        m.insert(
            "METRICS_SINK_ADDR".to_string(),
            Value::String(self.metrics_sink_addr.clone()),
        );
        m
    }
}

#[derive(Debug, Clone)]
pub struct RenderedConfig {
    pub text: String,
    pub hash: String,
}

/// Find all `{{name}}` tokens referenced in a template body.
fn referenced_variables(body: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        if let Some(end) = after.find("}}") {
            let name = after[..end].trim().to_string();
            if !name.is_empty() {
                names.push(name);
            }
            rest = &after[end + 2..];
        } else {
            break;
        }
    }
    names
}

fn value_matches_type(value: &Value, ty: VariableType) -> bool {
    match ty {
        VariableType::String => value.is_string(),
        VariableType::Integer => value.is_i64() || value.is_u64(),
        VariableType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
        VariableType::Bool => value.is_boolean(),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `validate(body)`: checks parseability, declared-variable completeness,
/// and structural invariants of the collector schema without
/// executing the collector.
pub fn validate(body: &str, variables: &[VariableSchema]) -> Result<(), TemplateError> {
    let declared: std::collections::HashSet<&str> =
        variables.iter().map(|v| v.name.as_str()).collect();
    let implicit = ["EXPERIMENT_ID", "VARIANT", "HOST_ID", "METRICS_SINK_ADDR"];

    for name in referenced_variables(body) {
        if !declared.contains(name.as_str()) && !implicit.contains(&name.as_str()) {
            return Err(TemplateError::UndeclaredVariable(name));
        }
    }

    let doc: serde_yaml::Value = serde_yaml::from_str(body)
        .map_err(|e| TemplateError::RenderSyntaxError(e.to_string()))?;

    let receivers = doc.get("receivers");
    if receivers.is_none() || !receivers.unwrap().is_mapping() {
        return Err(TemplateError::ValidationFailed(
            "config must declare at least one receiver".into(),
        ));
    }
    let exporters = doc.get("exporters");
    match exporters.and_then(|v| v.as_mapping()) {
        Some(m) if !m.is_empty() => {}
        _ => {
            return Err(TemplateError::ValidationFailed(
                "config must declare at least one exporter".into(),
            ))
        }
    }
    let pipelines = doc
        .get("service")
        .and_then(|s| s.get("pipelines"))
        .and_then(|p| p.as_mapping());
    match pipelines {
        Some(m) if !m.is_empty() => {}
        _ => {
            return Err(TemplateError::ValidationFailed(
                "service.pipelines must be non-empty".into(),
            ))
        }
    }

    Ok(())
}

/// Render a template body with the given variables and context. Pure and
/// idempotent: identical inputs produce byte-identical output.
pub fn render(
    template: &PipelineTemplate,
    variables: &HashMap<String, Value>,
    context: &RenderContext,
) -> Result<RenderedConfig, TemplateError> {
    let mut resolved: HashMap<String, Value> = HashMap::new();
    for schema in &template.variables {
        let value = match variables.get(&schema.name) {
            Some(v) => v.clone(),
            None => match &schema.default {
                Some(d) => d.clone(),
                None => {
                    if schema.required {
                        return Err(TemplateError::MissingVariable(schema.name.clone()));
                    }
                    continue;
                }
            },
        };
        if !value_matches_type(&value, schema.var_type) {
            return Err(TemplateError::TypeMismatch {
                name: schema.name.clone(),
                expected: schema.var_type,
                actual: value.to_string(),
            });
        }
        resolved.insert(schema.name.clone(), value);
    }

    // Reject variables the caller passed that the template never declared —
    // the renderer is otherwise oblivious to template semantics, but it does
    // own the declared-variable contract.
    let declared: std::collections::HashSet<&str> =
        template.variables.iter().map(|v| v.name.as_str()).collect();
    for name in variables.keys() {
        if !declared.contains(name.as_str()) {
            return Err(TemplateError::UndeclaredVariable(name.clone()));
        }
    }

    resolved.extend(context.as_map());

    let mut out = String::with_capacity(template.body.len());
    let mut rest = template.body.as_str();
    loop {
        match rest.find("{{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + 2..];
                let end = after
                    .find("}}")
                    .ok_or_else(|| TemplateError::RenderSyntaxError("unterminated {{".into()))?;
                let name = after[..end].trim();
                let value = resolved
                    .get(name)
                    .ok_or_else(|| TemplateError::UndeclaredVariable(name.to_string()))?;
                out.push_str(&stringify(value));
                rest = &after[end + 2..];
            }
        }
    }

    let hash = {
        let mut hasher = Sha256::new();
        hasher.update(out.as_bytes());
        hex::encode(hasher.finalize())
    };

    Ok(RenderedConfig { text: out, hash })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::builtin::all_templates;

    fn ctx() -> RenderContext {
        RenderContext {
            experiment_id: "exp-1".into(),
            variant: "candidate".into(),
            host_id: "h1".into(),
            metrics_sink_addr: "collector-sink:4317".into(),
        }
    }

    #[test]
    fn render_is_deterministic() {
        let template = all_templates()
            .into_iter()
            .find(|t| t.name == "process-topk-v1")
            .unwrap();
        let mut vars = HashMap::new();
        vars.insert("k".to_string(), Value::from(10));
        let a = render(&template, &vars, &ctx()).unwrap();
        let b = render(&template, &vars, &ctx()).unwrap();
        assert_eq!(a.text, b.text);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn render_then_validate_round_trips_for_all_builtins() {
        for template in all_templates() {
            let mut vars = HashMap::new();
            for schema in &template.variables {
                if let Some(default) = &schema.default {
                    vars.insert(schema.name.clone(), default.clone());
                }
            }
            let rendered = render(&template, &vars, &ctx())
                .unwrap_or_else(|e| panic!("render {} failed: {e}", template.name));
            validate(&rendered.text, &template.variables)
                .unwrap_or_else(|e| panic!("validate {} failed: {e}", template.name));
        }
    }

    #[test]
    fn undeclared_variable_in_body_is_rejected() {
        let body = "receivers:\n  otlp: {}\nexporters:\n  otlp: {}\nservice:\n  pipelines:\n    metrics:\n      receivers: [otlp]\n      exporters: [otlp]\nsurprise: {{ NOT_DECLARED }}\n";
        let err = validate(body, &[]).unwrap_err();
        assert!(matches!(err, TemplateError::UndeclaredVariable(_)));
    }

    #[test]
    fn missing_required_variable_fails_render() {
        let template = PipelineTemplate {
            name: "t".into(),
            version: "1".into(),
            description: "".into(),
            body: "k={{k}}".into(),
            variables: vec![VariableSchema {
                name: "k".into(),
                var_type: VariableType::Integer,
                default: None,
                required: true,
            }],
        };
        let err = render(&template, &HashMap::new(), &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingVariable(_)));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let template = PipelineTemplate {
            name: "t".into(),
            version: "1".into(),
            description: "".into(),
            body: "k={{k}}".into(),
            variables: vec![VariableSchema {
                name: "k".into(),
                var_type: VariableType::Integer,
                default: None,
                required: true,
            }],
        };
        let mut vars = HashMap::new();
        vars.insert("k".to_string(), Value::String("not-a-number".into()));
        let err = render(&template, &vars, &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::TypeMismatch { .. }));
    }
}
