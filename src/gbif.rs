use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};
use tracing::info;

use crate::config::{GbifCredentials, PollPolicy};
use crate::error::PipelineError;

/// Parameters for one occurrence download request.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub taxon_keys: Vec<u64>,
    pub countries: Vec<String>,
    pub allowed_basis: Vec<String>,
    pub max_uncertainty_m: f64,
}

impl DownloadRequest {
    /// JSON predicate for the GBIF occurrence download API: an OR block
    /// over all taxon keys, country whitelist, coordinate availability and
    /// geospatial-issue filters, uncertainty ceiling and basis-of-record
    /// restriction. Archive format is DwC-A.
    pub fn predicate(&self, creds: &GbifCredentials) -> Value {
        let taxon_predicates: Vec<Value> = self
            .taxon_keys
            .iter()
            .map(|key| json!({"type": "equals", "key": "TAXON_KEY", "value": key}))
            .collect();

        json!({
            "creator": creds.user,
            "notificationAddresses": [creds.email],
            "sendNotification": true,
            "format": "DWCA",
            "predicate": {
                "type": "and",
                "predicates": [
                    {"type": "or", "predicates": taxon_predicates},
                    {"type": "in", "key": "COUNTRY", "values": self.countries},
                    {"type": "equals", "key": "HAS_COORDINATE", "value": "TRUE"},
                    {"type": "equals", "key": "HAS_GEOSPATIAL_ISSUE", "value": "FALSE"},
                    {
                        "type": "lessThan",
                        "key": "COORDINATE_UNCERTAINTY_IN_METERS",
                        "value": format!("{}", self.max_uncertainty_m)
                    },
                    {"type": "in", "key": "BASIS_OF_RECORD", "values": self.allowed_basis}
                ]
            }
        })
    }
}

/// Remote job lifecycle as reported by the download status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded,
    /// Terminal failure; carries the status string GBIF reported
    /// (FAILED, KILLED, CANCELLED).
    Failed(String),
}

impl JobStatus {
    pub fn from_remote(status: &str) -> Self {
        match status {
            "SUCCEEDED" => JobStatus::Succeeded,
            "FAILED" | "KILLED" | "CANCELLED" => JobStatus::Failed(status.to_string()),
            _ => JobStatus::Pending,
        }
    }
}

pub trait GbifClient: Send + Sync {
    /// Submit a download request; returns the remote job key.
    fn submit(
        &self,
        request: &DownloadRequest,
        creds: &GbifCredentials,
    ) -> Result<String, PipelineError>;

    fn status(&self, job_key: &str) -> Result<JobStatus, PipelineError>;

    /// Stream the finished archive to `destination`.
    fn fetch_archive(&self, job_key: &str, destination: &Path) -> Result<(), PipelineError>;
}

/// Block until the remote job reaches a terminal state, bounded by the
/// poll policy. Exhausting the attempt budget is fatal; so is a remote
/// failure, reported with the job's own status detail.
pub fn wait_for_completion(
    client: &dyn GbifClient,
    job_key: &str,
    policy: PollPolicy,
) -> Result<(), PipelineError> {
    for attempt in 1..=policy.max_attempts {
        match client.status(job_key)? {
            JobStatus::Succeeded => {
                info!(job_key, attempt, "download job succeeded");
                return Ok(());
            }
            JobStatus::Failed(status) => {
                return Err(PipelineError::DownloadJobFailed {
                    key: job_key.to_string(),
                    status,
                });
            }
            JobStatus::Pending => {
                info!(job_key, attempt, "download job still running");
                if attempt < policy.max_attempts {
                    thread::sleep(policy.interval());
                }
            }
        }
    }
    Err(PipelineError::PollTimeout {
        key: job_key.to_string(),
        attempts: policy.max_attempts,
    })
}

#[derive(Clone)]
pub struct GbifHttpClient {
    client: Client,
    base_url: String,
}

impl GbifHttpClient {
    pub fn new() -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("gbif-natura/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PipelineError::GbifHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| PipelineError::GbifHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: "https://api.gbif.org/v1".to_string(),
        })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, PipelineError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(PipelineError::GbifHttp(err.to_string()));
                }
            }
        }
    }
}

impl GbifClient for GbifHttpClient {
    fn submit(
        &self,
        request: &DownloadRequest,
        creds: &GbifCredentials,
    ) -> Result<String, PipelineError> {
        let url = format!("{}/occurrence/download/request", self.base_url);
        let predicate = request.predicate(creds);
        let response = self.send_with_retries(|| {
            self.client
                .post(&url)
                .basic_auth(&creds.user, Some(&creds.password))
                .json(&predicate)
        })?;

        let status = response.status().as_u16();
        if status == 420 {
            return Err(PipelineError::TooManyDownloads);
        }
        if status != 201 {
            let message = response
                .text()
                .unwrap_or_else(|_| "download submission failed".to_string());
            return Err(PipelineError::GbifStatus { status, message });
        }
        let key = response
            .text()
            .map_err(|err| PipelineError::GbifHttp(err.to_string()))?
            .trim()
            .to_string();
        if key.is_empty() {
            return Err(PipelineError::GbifHttp(
                "empty job key in submission response".to_string(),
            ));
        }
        Ok(key)
    }

    fn status(&self, job_key: &str) -> Result<JobStatus, PipelineError> {
        let url = format!("{}/occurrence/download/{job_key}", self.base_url);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "status request failed".to_string());
            return Err(PipelineError::GbifStatus { status, message });
        }
        let body: Value = response
            .json()
            .map_err(|err| PipelineError::GbifHttp(err.to_string()))?;
        let remote = body
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::GbifHttp("status field missing".to_string()))?;
        Ok(JobStatus::from_remote(remote))
    }

    fn fetch_archive(&self, job_key: &str, destination: &Path) -> Result<(), PipelineError> {
        let url = format!(
            "{}/occurrence/download/request/{job_key}.zip",
            self.base_url
        );
        let mut response = self.send_with_retries(|| self.client.get(&url))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "archive fetch failed".to_string());
            return Err(PipelineError::GbifStatus { status, message });
        }
        let mut file =
            File::create(destination).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> GbifCredentials {
        GbifCredentials {
            user: "alice".to_string(),
            password: "secret".to_string(),
            email: "alice@example.org".to_string(),
        }
    }

    #[test]
    fn predicate_shape() {
        let request = DownloadRequest {
            taxon_keys: vec![2480946, 5231190],
            countries: vec!["PT".to_string(), "ES".to_string()],
            allowed_basis: vec!["HUMAN_OBSERVATION".to_string()],
            max_uncertainty_m: 1000.0,
        };
        let predicate = request.predicate(&creds());

        assert_eq!(predicate["format"], "DWCA");
        assert_eq!(predicate["creator"], "alice");
        let blocks = predicate["predicate"]["predicates"].as_array().unwrap();
        assert_eq!(blocks.len(), 6);
        let taxa = blocks[0]["predicates"].as_array().unwrap();
        assert_eq!(taxa.len(), 2);
        assert_eq!(taxa[0]["value"], 2480946);
        assert_eq!(blocks[1]["key"], "COUNTRY");
    }

    #[test]
    fn job_status_mapping() {
        assert_eq!(JobStatus::from_remote("SUCCEEDED"), JobStatus::Succeeded);
        assert_eq!(
            JobStatus::from_remote("KILLED"),
            JobStatus::Failed("KILLED".to_string())
        );
        assert_eq!(JobStatus::from_remote("PREPARING"), JobStatus::Pending);
        assert_eq!(JobStatus::from_remote("RUNNING"), JobStatus::Pending);
    }
}
