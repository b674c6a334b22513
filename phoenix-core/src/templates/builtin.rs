//! Built-in pipeline templates shipped with the control plane (spec §4.2).
//!
//! Each is a minimal OpenTelemetry Collector config skeleton with the
//! variables the experiment author can override. Real deployments would
//! register additional templates through the same `PipelineTemplate`
//! shape; these five cover the reduction strategies the KPI analyzer
//! scenarios exercise.

use crate::model::{PipelineTemplate, VariableSchema, VariableType};
use serde_json::Value;

fn schema(name: &str, ty: VariableType, default: Option<Value>, required: bool) -> VariableSchema {
    VariableSchema {
        name: name.to_string(),
        var_type: ty,
        default,
        required,
    }
}

/// Passthrough baseline: no sampling, no filtering. Used as the control
/// arm in most experiments.
fn baseline() -> PipelineTemplate {
    PipelineTemplate {
        name: "process-baseline-v1".to_string(),
        version: "1".to_string(),
        description: "Passthrough collector with no reduction applied".to_string(),
        body: r#"receivers:
  otlp:
    protocols:
      grpc:
exporters:
  otlp:
    endpoint: "{{METRICS_SINK_ADDR}}"
processors:
  batch:
service:
  pipelines:
    metrics:
      receivers: [otlp]
      processors: [batch]
      exporters: [otlp]
"#
        .to_string(),
        variables: vec![],
    }
}

/// Drops metrics below a priority threshold via the `filter` processor.
fn priority_filter() -> PipelineTemplate {
    PipelineTemplate {
        name: "process-priority-filter-v1".to_string(),
        version: "1".to_string(),
        description: "Drops metrics whose priority label is below the configured threshold"
            .to_string(),
        body: r#"receivers:
  otlp:
    protocols:
      grpc:
exporters:
  otlp:
    endpoint: "{{METRICS_SINK_ADDR}}"
processors:
  batch:
  filter/priority:
    metrics:
      metric:
        - 'attributes["priority"] < {{min_priority}}'
service:
  pipelines:
    metrics:
      receivers: [otlp]
      processors: [filter/priority, batch]
      exporters: [otlp]
"#
        .to_string(),
        variables: vec![schema(
            "min_priority",
            VariableType::Integer,
            Some(Value::from(5)),
            true,
        )],
    }
}

/// Keeps only the top-k highest-cardinality series per collection
/// interval via `groupbyattrs` + `topk` processors.
fn topk() -> PipelineTemplate {
    PipelineTemplate {
        name: "process-topk-v1".to_string(),
        version: "1".to_string(),
        description: "Retains only the top-k series by value per interval".to_string(),
        body: r#"receivers:
  otlp:
    protocols:
      grpc:
exporters:
  otlp:
    endpoint: "{{METRICS_SINK_ADDR}}"
processors:
  batch:
  topk:
    k: {{k}}
service:
  pipelines:
    metrics:
      receivers: [otlp]
      processors: [topk, batch]
      exporters: [otlp]
"#
        .to_string(),
        variables: vec![schema("k", VariableType::Integer, Some(Value::from(20)), true)],
    }
}

/// Pre-aggregates series into coarser buckets via the `metricstransform`
/// processor before export, trading cardinality for resolution.
fn aggregated() -> PipelineTemplate {
    PipelineTemplate {
        name: "process-aggregated-v1".to_string(),
        version: "1".to_string(),
        description: "Aggregates series into fixed-size windows before export".to_string(),
        body: r#"receivers:
  otlp:
    protocols:
      grpc:
exporters:
  otlp:
    endpoint: "{{METRICS_SINK_ADDR}}"
processors:
  batch:
  metricstransform:
    transforms:
      - include: '.*'
        match_type: regexp
        action: combine
        aggregation_type: {{aggregation}}
        submatch_case: lower
service:
  pipelines:
    metrics:
      receivers: [otlp]
      processors: [metricstransform, batch]
      exporters: [otlp]
"#
        .to_string(),
        variables: vec![schema(
            "aggregation",
            VariableType::String,
            Some(Value::String("sum".to_string())),
            true,
        )],
    }
}

/// Adjusts its own reduction aggressiveness based on observed ingest rate,
/// exercised by scenarios that probe resource-usage-driven behavior.
fn adaptive_filter() -> PipelineTemplate {
    PipelineTemplate {
        name: "process-adaptive-filter-v1".to_string(),
        version: "1".to_string(),
        description: "Filters proportionally to ingest rate above a target ceiling".to_string(),
        body: r#"receivers:
  otlp:
    protocols:
      grpc:
exporters:
  otlp:
    endpoint: "{{METRICS_SINK_ADDR}}"
processors:
  batch:
  filter/adaptive:
    metrics:
      metric:
        - 'rate() > {{target_points_per_sec}}'
service:
  pipelines:
    metrics:
      receivers: [otlp]
      processors: [filter/adaptive, batch]
      exporters: [otlp]
"#
        .to_string(),
        variables: vec![schema(
            "target_points_per_sec",
            VariableType::Float,
            Some(Value::from(5000.0)),
            true,
        )],
    }
}

pub fn all_templates() -> Vec<PipelineTemplate> {
    vec![
        baseline(),
        priority_filter(),
        topk(),
        aggregated(),
        adaptive_filter(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::validate;

    #[test]
    fn every_builtin_template_name_is_unique() {
        let templates = all_templates();
        let mut names: Vec<&str> = templates.iter().map(|t| t.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), templates.len());
    }

    #[test]
    fn every_builtin_template_validates_structurally() {
        for template in all_templates() {
            validate(&template.body, &template.variables)
                .unwrap_or_else(|e| panic!("{} failed validation: {e}", template.name));
        }
    }
}
