//! KPI Analyzer: computes the numerical result of an
//! experiment from a metrics backend.
//!
//! The `MetricsBackend` trait is the external collaborator boundary,
//! mirroring the teacher's `Embedder`/`VectorStore` split — a small
//! query-template surface in front of whatever time-series system is
//! actually deployed, with an in-memory recording double standing in
//! for it in tests.

use crate::config::CostModel;
use crate::model::{ExperimentId, HostId, Variant};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("metrics backend unavailable: {0}")]
    MetricsBackendUnavailable(String),
    #[error("insufficient data window: {0}")]
    InsufficientDataWindow,
    #[error("label mismatch between baseline and candidate series: {0}")]
    LabelMismatch(String),
}

/// One time series as returned by a metrics backend query: a label set
/// plus the raw sample points observed over the queried window.
#[derive(Debug, Clone)]
pub struct Series {
    pub labels: HashMap<String, String>,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

/// External collaborator boundary: `range_query` /
/// `instant_query` over a small set of query templates referencing
/// `experiment_id`, `variant`, `host`.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn range_query(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_secs: u64,
    ) -> Result<Vec<Series>, AnalyzerError>;

    async fn instant_query(&self, expr: &str, at: DateTime<Utc>) -> Result<Vec<Series>, AnalyzerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostBreakdown {
    pub host: String,
    pub ingest_baseline: f64,
    pub ingest_candidate: f64,
    pub cardinality_baseline: u64,
    pub cardinality_candidate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiResult {
    pub cardinality_baseline: u64,
    pub cardinality_candidate: u64,
    pub cardinality_reduction_pct: Option<f64>,
    pub ingest_baseline: f64,
    pub ingest_candidate: f64,
    pub cost_baseline: f64,
    pub cost_candidate: f64,
    pub cost_reduction_pct: Option<f64>,
    pub per_host_breakdown: Vec<HostBreakdown>,
    pub critical_process_retention_pct: f64,
    pub notes: Vec<String>,
}

/// `reduction_pct = 100 * (baseline - candidate) / baseline`, clamped to
/// `[0, 100]`; `None` (with a note) when `baseline == 0`.
fn reduction_pct(baseline: f64, candidate: f64, notes: &mut Vec<String>, label: &str) -> Option<f64> {
    if baseline == 0.0 {
        notes.push(format!("{label} reduction undefined: baseline is zero"));
        return None;
    }
    let pct = 100.0 * (baseline - candidate) / baseline;
    Some(pct.clamp(0.0, 100.0))
}

/// Distinct `__name__` x label-set pairs observed in a set of series,
/// i.e. `count by (__name__)` over the window.
fn cardinality(series: &[Series]) -> u64 {
    let mut seen: HashSet<Vec<(String, String)>> = HashSet::new();
    for s in series {
        let mut pairs: Vec<(String, String)> = s.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        pairs.sort();
        seen.insert(pairs);
    }
    seen.len() as u64
}

/// Mean of the last sample of every series, used as an ingest-rate proxy.
fn ingest_rate(series: &[Series]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let sum: f64 = series.iter().filter_map(|s| s.points.last()).map(|(_, v)| v).sum();
    sum
}

pub struct Analyzer<M: MetricsBackend> {
    backend: M,
    cost_model: CostModel,
    critical_process_names: Vec<String>,
}

/// Object-safe facade over `Analyzer<M>` so the controller can hold an
/// `Arc<dyn AnalysisRunner>` instead of threading the backend type
/// parameter through every caller.
#[async_trait]
pub trait AnalysisRunner: Send + Sync {
    async fn analyze(
        &self,
        experiment_id: &ExperimentId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        hosts: &[HostId],
    ) -> Result<KpiResult, AnalyzerError>;
}

#[async_trait]
impl<M: MetricsBackend> AnalysisRunner for Analyzer<M> {
    async fn analyze(
        &self,
        experiment_id: &ExperimentId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        hosts: &[HostId],
    ) -> Result<KpiResult, AnalyzerError> {
        Analyzer::analyze(self, experiment_id, start, end, hosts).await
    }
}

impl<M: MetricsBackend> Analyzer<M> {
    pub fn new(backend: M, cost_model: CostModel, critical_process_names: Vec<String>) -> Self {
        Self {
            backend,
            cost_model,
            critical_process_names,
        }
    }

    pub async fn analyze(
        &self,
        experiment_id: &ExperimentId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        hosts: &[HostId],
    ) -> Result<KpiResult, AnalyzerError> {
        if end <= start {
            return Err(AnalyzerError::InsufficientDataWindow);
        }

        let baseline_expr = format!(
            "{{experiment_id=\"{experiment_id}\",variant=\"{}\"}}",
            Variant::Baseline
        );
        let candidate_expr = format!(
            "{{experiment_id=\"{experiment_id}\",variant=\"{}\"}}",
            Variant::Candidate
        );

        let baseline_series = self.backend.range_query(&baseline_expr, start, end, 60).await?;
        let candidate_series = self.backend.range_query(&candidate_expr, start, end, 60).await?;

        if baseline_series.is_empty() && candidate_series.is_empty() {
            return Err(AnalyzerError::InsufficientDataWindow);
        }

        let baseline_hosts: HashSet<&str> = baseline_series
            .iter()
            .filter_map(|s| s.labels.get("host").map(|h| h.as_str()))
            .collect();
        let candidate_hosts: HashSet<&str> = candidate_series
            .iter()
            .filter_map(|s| s.labels.get("host").map(|h| h.as_str()))
            .collect();
        if !baseline_hosts.is_empty()
            && !candidate_hosts.is_empty()
            && baseline_hosts.symmetric_difference(&candidate_hosts).count() > 0
        {
            return Err(AnalyzerError::LabelMismatch(
                "baseline and candidate series cover different host sets".into(),
            ));
        }

        let mut notes = Vec::new();

        let cardinality_baseline = cardinality(&baseline_series);
        let cardinality_candidate = cardinality(&candidate_series);
        let cardinality_reduction_pct = reduction_pct(
            cardinality_baseline as f64,
            cardinality_candidate as f64,
            &mut notes,
            "cardinality",
        );

        let ingest_baseline = ingest_rate(&baseline_series);
        let ingest_candidate = ingest_rate(&candidate_series);

        let cost_baseline = self.cost_model.cost(ingest_baseline);
        let cost_candidate = self.cost_model.cost(ingest_candidate);
        let cost_reduction_pct = reduction_pct(cost_baseline, cost_candidate, &mut notes, "cost");

        let mut per_host: HashMap<String, HostBreakdown> = HashMap::new();
        for host in hosts {
            per_host.insert(
                host.to_string(),
                HostBreakdown {
                    host: host.to_string(),
                    ingest_baseline: 0.0,
                    ingest_candidate: 0.0,
                    cardinality_baseline: 0,
                    cardinality_candidate: 0,
                },
            );
        }
        for s in &baseline_series {
            if let Some(host) = s.labels.get("host") {
                let entry = per_host.entry(host.clone()).or_insert_with(|| HostBreakdown {
                    host: host.clone(),
                    ingest_baseline: 0.0,
                    ingest_candidate: 0.0,
                    cardinality_baseline: 0,
                    cardinality_candidate: 0,
                });
                entry.ingest_baseline += s.points.last().map(|(_, v)| *v).unwrap_or(0.0);
                entry.cardinality_baseline += 1;
            }
        }
        for s in &candidate_series {
            if let Some(host) = s.labels.get("host") {
                let entry = per_host.entry(host.clone()).or_insert_with(|| HostBreakdown {
                    host: host.clone(),
                    ingest_baseline: 0.0,
                    ingest_candidate: 0.0,
                    cardinality_baseline: 0,
                    cardinality_candidate: 0,
                });
                entry.ingest_candidate += s.points.last().map(|(_, v)| *v).unwrap_or(0.0);
                entry.cardinality_candidate += 1;
            }
        }
        let mut per_host_breakdown: Vec<HostBreakdown> = per_host.into_values().collect();
        per_host_breakdown.sort_by(|a, b| a.host.cmp(&b.host));

        let retained = self
            .critical_process_names
            .iter()
            .filter(|name| {
                candidate_series
                    .iter()
                    .any(|s| s.labels.get("process").map(|p| p == *name).unwrap_or(false))
            })
            .count();
        let critical_process_retention_pct = if self.critical_process_names.is_empty() {
            100.0
        } else {
            100.0 * retained as f64 / self.critical_process_names.len() as f64
        };

        Ok(KpiResult {
            cardinality_baseline,
            cardinality_candidate,
            cardinality_reduction_pct,
            ingest_baseline,
            ingest_candidate,
            cost_baseline,
            cost_candidate,
            cost_reduction_pct,
            per_host_breakdown,
            critical_process_retention_pct,
            notes,
        })
    }
}

/// In-memory double recording fixed series per expression, used as the
/// default backend in tests so analyzer output is deterministic
/// (testable property: analyzer determinism).
#[derive(Default)]
pub struct RecordingMetricsBackend {
    series: Mutex<HashMap<String, Vec<Series>>>,
    fail: Mutex<bool>,
}

impl RecordingMetricsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_series(&self, expr: &str, series: Vec<Series>) {
        self.series.lock().unwrap().insert(expr.to_string(), series);
    }

    pub fn set_unavailable(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl MetricsBackend for RecordingMetricsBackend {
    async fn range_query(
        &self,
        expr: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _step_secs: u64,
    ) -> Result<Vec<Series>, AnalyzerError> {
        if *self.fail.lock().unwrap() {
            return Err(AnalyzerError::MetricsBackendUnavailable(
                "backend unreachable".into(),
            ));
        }
        Ok(self.series.lock().unwrap().get(expr).cloned().unwrap_or_default())
    }

    async fn instant_query(&self, expr: &str, _at: DateTime<Utc>) -> Result<Vec<Series>, AnalyzerError> {
        if *self.fail.lock().unwrap() {
            return Err(AnalyzerError::MetricsBackendUnavailable(
                "backend unreachable".into(),
            ));
        }
        Ok(self
            .series
            .lock()
            .unwrap()
            .get(expr)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|mut s| {
                s.points.truncate(1);
                s
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn series(host: &str, name: &str, value: f64) -> Series {
        let mut labels = HashMap::new();
        labels.insert("__name__".to_string(), name.to_string());
        labels.insert("host".to_string(), host.to_string());
        Series {
            labels,
            points: vec![(Utc::now(), value)],
        }
    }

    fn setup(exp: &ExperimentId) -> RecordingMetricsBackend {
        let backend = RecordingMetricsBackend::new();
        backend.set_series(
            &format!("{{experiment_id=\"{exp}\",variant=\"baseline\"}}"),
            vec![series("h1", "points_in", 10_000.0), series("h1", "points_out", 10_000.0)],
        );
        backend.set_series(
            &format!("{{experiment_id=\"{exp}\",variant=\"candidate\"}}"),
            vec![series("h1", "points_in", 3_000.0)],
        );
        backend
    }

    #[tokio::test]
    async fn cardinality_and_cost_reduction_computed_identically() {
        let exp = ExperimentId::new();
        let backend = setup(&exp);
        let analyzer = Analyzer::new(backend, CostModel::default(), vec![]);
        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now();
        let result = analyzer
            .analyze(&exp, start, end, &[HostId::from("h1")])
            .await
            .unwrap();
        assert_eq!(result.cardinality_baseline, 2);
        assert_eq!(result.cardinality_candidate, 1);
        assert_eq!(result.cardinality_reduction_pct, Some(50.0));
        assert!(result.cost_baseline > result.cost_candidate);
    }

    #[tokio::test]
    async fn zero_baseline_yields_null_reduction_with_note() {
        let exp = ExperimentId::new();
        let backend = RecordingMetricsBackend::new();
        backend.set_series(
            &format!("{{experiment_id=\"{exp}\",variant=\"baseline\"}}"),
            vec![],
        );
        backend.set_series(
            &format!("{{experiment_id=\"{exp}\",variant=\"candidate\"}}"),
            vec![series("h1", "points_in", 100.0)],
        );
        let analyzer = Analyzer::new(backend, CostModel::default(), vec![]);
        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now();
        let result = analyzer.analyze(&exp, start, end, &[]).await.unwrap();
        assert_eq!(result.cardinality_reduction_pct, None);
        assert!(!result.notes.is_empty());
    }

    #[tokio::test]
    async fn empty_window_on_both_sides_is_insufficient_data() {
        let exp = ExperimentId::from_str(&ExperimentId::new().to_string()).unwrap();
        let backend = RecordingMetricsBackend::new();
        let analyzer = Analyzer::new(backend, CostModel::default(), vec![]);
        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now();
        let err = analyzer.analyze(&exp, start, end, &[]).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::InsufficientDataWindow));
    }

    #[tokio::test]
    async fn backend_unavailable_propagates() {
        let exp = ExperimentId::new();
        let backend = RecordingMetricsBackend::new();
        backend.set_unavailable(true);
        let analyzer = Analyzer::new(backend, CostModel::default(), vec![]);
        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now();
        let err = analyzer.analyze(&exp, start, end, &[]).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::MetricsBackendUnavailable(_)));
    }
}
