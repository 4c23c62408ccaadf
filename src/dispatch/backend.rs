use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{ExecutionBackend, Job, JobSpec, JobStatus};

/// Connection and resource settings for the batch-jobs backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the jobs API. Unset disables the backend.
    pub api_url: Option<String>,
    pub namespace: String,
    pub token: Option<String>,
    pub image: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub poll_interval_s: u64,
    pub timeout_s: u64,
    pub request_timeout_s: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            namespace: "default".to_string(),
            token: None,
            image: "qaflow-runner:latest".to_string(),
            cpu: Some("500m".to_string()),
            memory: Some("1Gi".to_string()),
            poll_interval_s: 5,
            timeout_s: 1800,
            request_timeout_s: 10,
        }
    }
}

/// Creates one batch job per flow run through a `batch/v1`-style REST API.
pub struct HttpJobBackend {
    api_url: String,
    namespace: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpJobBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let api_url = config
            .api_url
            .as_deref()
            .context("Backend api_url is not configured")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_s.max(1)))
            .build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            token: config.token.clone(),
            client,
        })
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.api_url, self.namespace
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn manifest(spec: &JobSpec) -> serde_json::Value {
        let env: Vec<serde_json::Value> = spec
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        let mut limits = serde_json::Map::new();
        if let Some(cpu) = &spec.cpu {
            limits.insert("cpu".to_string(), json!(cpu));
        }
        if let Some(memory) = &spec.memory {
            limits.insert("memory".to_string(), json!(memory));
        }
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": spec.name, "labels": spec.labels },
            "spec": {
                "backoffLimit": 0,
                "template": {
                    "metadata": { "labels": spec.labels },
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "runner",
                            "image": spec.image,
                            "command": spec.command,
                            "env": env,
                            "resources": { "limits": limits }
                        }]
                    }
                }
            }
        })
    }
}

#[derive(Deserialize)]
struct JobResource {
    #[serde(default)]
    status: JobStatus,
}

#[async_trait]
impl ExecutionBackend for HttpJobBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<Job> {
        let response = self
            .authorize(self.client.post(self.jobs_url()))
            .json(&Self::manifest(spec))
            .send()
            .await
            .context("Job backend unreachable")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Job backend refused '{}' ({}): {}", spec.name, status, text);
        }
        info!(job = %spec.name, "Backend job created");
        Ok(Job {
            name: spec.name.clone(),
            backend: self.name().to_string(),
        })
    }

    async fn job_status(&self, job: &Job) -> Result<JobStatus> {
        let url = format!("{}/{}", self.jobs_url(), job.name);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("Failed to poll job '{}'", job.name))?;
        if !response.status().is_success() {
            bail!("Polling job '{}' returned {}", job.name, response.status());
        }
        let resource: JobResource = response
            .json()
            .await
            .with_context(|| format!("Invalid status for job '{}'", job.name))?;
        debug!(job = %job.name, status = ?resource.status, "Polled job");
        Ok(resource.status)
    }

    async fn delete_job(&self, job: &Job) -> Result<()> {
        let url = format!(
            "{}/{}?propagationPolicy=Background",
            self.jobs_url(),
            job.name
        );
        let response = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .with_context(|| format!("Failed to delete job '{}'", job.name))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            bail!("Deleting job '{}' returned {}", job.name, response.status());
        }
        Ok(())
    }
}

/// Backend that refuses every job, so runs always execute locally.
pub struct DisabledBackend;

#[async_trait]
impl ExecutionBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<Job> {
        bail!("No execution backend configured for '{}'", spec.name)
    }

    async fn job_status(&self, job: &Job) -> Result<JobStatus> {
        bail!("No execution backend configured for '{}'", job.name)
    }

    async fn delete_job(&self, _job: &Job) -> Result<()> {
        Ok(())
    }
}
