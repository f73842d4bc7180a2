//! MLflow REST 2.0 client.
//!
//! All HTTP status mapping lives here; callers only see [`TrackingError`].

use super::{RunQuery, TrackingStore};
use crate::config::TrackingConfig;
use crate::error::{TrackingError, TrackingResult};
use crate::run::{Experiment, ModelVersion, RUN_NAME_TAG, Run, RunId, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const USER_AGENT_VALUE: &str = concat!("mltrack/", env!("CARGO_PKG_VERSION"));

/// Largest page the server hands out per search request.
const SEARCH_PAGE_SIZE: usize = 1000;

const ARTIFACT_SCHEME: &str = "mlflow-artifacts:";

/// HTTP client for an MLflow-compatible tracking server.
#[derive(Debug, Clone)]
pub struct MlflowClient {
    client: reqwest::Client,
    base_url: String,
}

impl MlflowClient {
    pub fn new(config: &TrackingConfig) -> TrackingResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let mut builder = reqwest::Client::builder().default_headers(default_headers);
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().map_err(|e| {
            TrackingError::Config(format!("failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            client,
            base_url: config.uri.trim_end_matches('/').to_string(),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, endpoint)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> TrackingResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| TrackingError::network(&self.base_url, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let code = parsed.error_code;
        if status == reqwest::StatusCode::NOT_FOUND
            || code.as_deref() == Some("RESOURCE_DOES_NOT_EXIST")
        {
            return Err(TrackingError::not_found(kind, name));
        }
        Err(TrackingError::Api {
            status: status.as_u16(),
            code,
            message: parsed.message.unwrap_or(body),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> TrackingResult<T> {
        let response = self.send(request, kind, name).await?;
        let body = response
            .text()
            .await
            .map_err(|e| TrackingError::network(&self.base_url, e.to_string()))?;
        serde_json::from_str(&body)
            .map_err(|e| TrackingError::parse(format!("{kind} response"), e.to_string()))
    }

    async fn ensure_registered_model(&self, name: &str) -> TrackingResult<()> {
        let url = self.api_url("registered-models/create");
        debug!(url = %url, model = name, "creating registered model");
        let request = self.client.post(&url).json(&serde_json::json!({ "name": name }));
        match self.send(request, "registered model", name).await {
            Ok(_) => Ok(()),
            Err(TrackingError::Api { code: Some(code), .. })
                if code == "RESOURCE_ALREADY_EXISTS" =>
            {
                debug!(model = name, "registered model already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TrackingStore for MlflowClient {
    async fn experiment_by_name(&self, name: &str) -> TrackingResult<Option<Experiment>> {
        let url = self.api_url("experiments/get-by-name");
        debug!(url = %url, experiment = name, "looking up experiment");
        let request = self.client.get(&url).query(&[("experiment_name", name)]);
        match self
            .send_json::<ExperimentResponse>(request, "experiment", name)
            .await
        {
            Ok(resp) => Ok(Some(resp.experiment.into())),
            Err(TrackingError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn search_runs(&self, query: &RunQuery) -> TrackingResult<Vec<Run>> {
        let url = self.api_url("runs/search");
        let filter = query.filter_string();
        let order_by = query.order_clauses();
        let mut runs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let remaining = query.max_results.map(|m| m.saturating_sub(runs.len()));
            if remaining == Some(0) {
                break;
            }
            let body = SearchRunsRequest {
                experiment_ids: &query.experiment_ids,
                filter: &filter,
                order_by: &order_by,
                max_results: remaining.unwrap_or(SEARCH_PAGE_SIZE).min(SEARCH_PAGE_SIZE),
                page_token: page_token.as_deref(),
            };
            debug!(url = %url, filter = %filter, page = ?page_token, "searching runs");
            let request = self.client.post(&url).json(&body);
            let page: SearchRunsResponse = self
                .send_json(request, "experiment", &query.experiment_ids.join(","))
                .await?;

            runs.extend(page.runs.into_iter().map(Run::from));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        if let Some(max) = query.max_results {
            runs.truncate(max);
        }
        Ok(runs)
    }

    async fn get_run(&self, run_id: &RunId) -> TrackingResult<Run> {
        let url = self.api_url("runs/get");
        debug!(url = %url, run_id = %run_id, "fetching run");
        let request = self.client.get(&url).query(&[("run_id", run_id.as_str())]);
        let resp: GetRunResponse = self.send_json(request, "run", run_id.as_str()).await?;
        Ok(resp.run.into())
    }

    async fn log_metric(
        &self,
        run_id: &RunId,
        key: &str,
        value: f64,
        step: i64,
    ) -> TrackingResult<()> {
        let url = self.api_url("runs/log-metric");
        debug!(url = %url, run_id = %run_id, key, value, step, "logging metric");
        let body = LogMetricRequest {
            run_id: run_id.as_str(),
            key,
            value,
            timestamp: Utc::now().timestamp_millis(),
            step,
        };
        self.send(self.client.post(&url).json(&body), "run", run_id.as_str())
            .await?;
        Ok(())
    }

    async fn log_artifact(
        &self,
        run: &Run,
        local_path: &Path,
        artifact_dir: &str,
    ) -> TrackingResult<String> {
        let artifact_uri = run
            .artifact_uri
            .as_deref()
            .ok_or_else(|| TrackingError::not_found("artifact URI for run", run.id().as_str()))?;
        let root = proxied_artifact_root(artifact_uri).ok_or_else(|| {
            TrackingError::Unsupported(format!(
                "artifact store '{artifact_uri}' is not served through the tracking server"
            ))
        })?;
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TrackingError::not_found("artifact file", local_path.display().to_string())
            })?;

        let content = match tokio::fs::read(local_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrackingError::not_found(
                    "artifact file",
                    local_path.display().to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let relative = join_artifact_path(&[artifact_dir, &file_name]);
        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}",
            self.base_url,
            encode_segments(&join_artifact_path(&[&root, &relative]))
        );
        debug!(url = %url, bytes = content.len(), "uploading artifact");
        let request = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(content);
        self.send(request, "artifact root", &root).await?;
        Ok(relative)
    }

    async fn register_model(
        &self,
        name: &str,
        source: &str,
        run_id: &RunId,
    ) -> TrackingResult<ModelVersion> {
        self.ensure_registered_model(name).await?;

        let url = self.api_url("model-versions/create");
        debug!(url = %url, model = name, source, "creating model version");
        let body = CreateModelVersionRequest {
            name,
            source,
            run_id: run_id.as_str(),
        };
        let resp: CreateModelVersionResponse = self
            .send_json(self.client.post(&url).json(&body), "registered model", name)
            .await?;
        let version = resp.model_version.version.parse::<u64>().map_err(|e| {
            TrackingError::parse(
                "model version",
                format!("'{}': {e}", resp.model_version.version),
            )
        })?;
        Ok(ModelVersion {
            name: resp.model_version.name,
            version,
            source: resp.model_version.source.unwrap_or_else(|| source.to_string()),
            run_id: Some(
                resp.model_version
                    .run_id
                    .map(RunId::new)
                    .unwrap_or_else(|| run_id.clone()),
            ),
        })
    }
}

/// Path below the proxied artifact root for `mlflow-artifacts:` URIs.
///
/// Accepts both `mlflow-artifacts:/1/abc/artifacts` and the host-qualified
/// `mlflow-artifacts://host:5000/1/abc/artifacts`.
pub fn proxied_artifact_root(artifact_uri: &str) -> Option<String> {
    let rest = artifact_uri.strip_prefix(ARTIFACT_SCHEME)?;
    let path = match rest.strip_prefix("//") {
        Some(with_host) => with_host.split_once('/').map_or("", |(_, p)| p),
        None => rest,
    };
    Some(path.trim_matches('/').to_string())
}

fn join_artifact_path(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn encode_segments(path: &str) -> String {
    path.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// --- Wire format -------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExperimentResponse {
    experiment: WireExperiment,
}

#[derive(Debug, Deserialize)]
struct WireExperiment {
    experiment_id: String,
    name: String,
    #[serde(default)]
    artifact_location: Option<String>,
    #[serde(default)]
    lifecycle_stage: Option<String>,
}

impl From<WireExperiment> for Experiment {
    fn from(w: WireExperiment) -> Self {
        Experiment {
            id: w.experiment_id,
            name: w.name,
            artifact_location: w.artifact_location,
            lifecycle_stage: w.lifecycle_stage,
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchRunsRequest<'a> {
    experiment_ids: &'a [String],
    #[serde(skip_serializing_if = "str::is_empty")]
    filter: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    order_by: &'a [String],
    max_results: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SearchRunsResponse {
    #[serde(default)]
    runs: Vec<WireRun>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetRunResponse {
    run: WireRun,
}

#[derive(Debug, Deserialize)]
struct WireRun {
    info: WireRunInfo,
    #[serde(default)]
    data: WireRunData,
}

#[derive(Debug, Deserialize)]
struct WireRunInfo {
    run_id: String,
    #[serde(default)]
    run_name: Option<String>,
    #[serde(default)]
    experiment_id: String,
    status: RunStatus,
    #[serde(default, deserialize_with = "lenient_i64")]
    start_time: Option<i64>,
    #[serde(default)]
    artifact_uri: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireRunData {
    #[serde(default)]
    metrics: Vec<WireMetric>,
    #[serde(default)]
    params: Vec<WireKeyValue>,
    #[serde(default)]
    tags: Vec<WireKeyValue>,
}

#[derive(Debug, Deserialize)]
struct WireMetric {
    key: String,
    #[serde(deserialize_with = "lenient_f64")]
    value: f64,
}

#[derive(Debug, Deserialize)]
struct WireKeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

impl From<WireRun> for Run {
    fn from(w: WireRun) -> Self {
        let mut run = Run::new(w.info.run_id)
            .with_experiment(w.info.experiment_id)
            .with_status(w.info.status);
        run.start_time = w.info.start_time.and_then(DateTime::<Utc>::from_timestamp_millis);
        run.artifact_uri = w.info.artifact_uri;
        for kv in w.data.params {
            run.params.insert(kv.key, kv.value);
        }
        for kv in w.data.tags {
            run.tags.insert(kv.key, kv.value);
        }
        for m in w.data.metrics {
            run.metrics.insert(m.key, m.value);
        }
        if let Some(name) = w.info.run_name.filter(|n| !n.trim().is_empty()) {
            if run.name().is_none() {
                run.tags.insert(RUN_NAME_TAG.to_string(), name);
            }
        }
        run
    }
}

#[derive(Debug, Serialize)]
struct LogMetricRequest<'a> {
    run_id: &'a str,
    key: &'a str,
    value: f64,
    timestamp: i64,
    step: i64,
}

#[derive(Debug, Serialize)]
struct CreateModelVersionRequest<'a> {
    name: &'a str,
    source: &'a str,
    run_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateModelVersionResponse {
    model_version: WireModelVersion,
}

#[derive(Debug, Deserialize)]
struct WireModelVersion {
    name: String,
    #[serde(deserialize_with = "string_or_number")]
    version: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
}

/// int64 fields may arrive as JSON numbers or strings.
fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// Metric values may be `"NaN"`/`"Infinity"` strings.
fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Number(n) => Ok(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Ok(s.parse().unwrap_or(f64::NAN)),
        other => Err(serde::de::Error::custom(format!(
            "expected metric value, got {other}"
        ))),
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected version, got {other}"
        ))),
    }
}
