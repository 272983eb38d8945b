use std::thread;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local};
use reqwest::Method;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info};

use crate::error::HarvestError;

const TRANSFER_API: &str = "https://storagetransfer.googleapis.com/v1";
const STORAGE_UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1";
pub const ACCESS_TOKEN_VAR: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self, HarvestError> {
        Ok(Self {
            access_key_id: env_var("AWS_ACCESS_KEY_ID")?,
            secret_access_key: env_var("AWS_SECRET_ACCESS_KEY")?,
        })
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

fn env_var(name: &str) -> Result<String, HarvestError> {
    std::env::var(name).map_err(|_| HarvestError::MissingCredentials(name.to_string()))
}

/// `<name>-<source bucket>-<YYYY-mm-dd-HH-MM-SS>`
pub fn job_name(base: &str, source_bucket: &str, now: DateTime<Local>) -> String {
    format!("{base}-{source_bucket}-{}", now.format("%Y-%m-%d-%H-%M-%S"))
}

/// One bucket-to-bucket copy driven by a manifest of object paths.
#[derive(Debug, Clone, Serialize)]
pub struct TransferJobSpec {
    pub name: String,
    pub project_id: String,
    pub source_bucket: String,
    pub destination_bucket: String,
    pub manifest_bucket: String,
    #[serde(skip)]
    pub created_at: DateTime<Local>,
}

impl TransferJobSpec {
    pub fn manifest_object(&self) -> String {
        format!("{}.tsv", self.name)
    }

    pub fn manifest_location(&self) -> String {
        format!("gs://{}/{}", self.manifest_bucket, self.manifest_object())
    }

    /// Job resource scheduled to run once, on the day it is created.
    pub fn request_body(&self, credentials: &AwsCredentials) -> Value {
        let day = json!({
            "year": self.created_at.year(),
            "month": self.created_at.month(),
            "day": self.created_at.day(),
        });
        json!({
            "name": format!("transferJobs/{}", self.name),
            "projectId": self.project_id,
            "status": "ENABLED",
            "schedule": {
                "scheduleStartDate": day,
                "scheduleEndDate": day,
            },
            "transferSpec": {
                "awsS3DataSource": {
                    "bucketName": self.source_bucket,
                    "awsAccessKey": {
                        "accessKeyId": credentials.access_key_id,
                        "secretAccessKey": credentials.secret_access_key,
                    },
                },
                "gcsDataSink": {
                    "bucketName": self.destination_bucket,
                },
                "transferManifest": {
                    "location": self.manifest_location(),
                },
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub name: String,
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// No operation has been started for the job yet.
    Queued,
    Running,
    Success,
    Failed,
}

impl TransferState {
    pub fn from_operation_status(status: &str) -> Self {
        match status {
            "SUCCESS" => TransferState::Success,
            "FAILED" | "ABORTED" => TransferState::Failed,
            _ => TransferState::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferStatus {
    pub done: bool,
    pub state: TransferState,
    /// Status string as reported by the service.
    pub status: String,
}

pub trait TransferClient: Send + Sync {
    fn submit(
        &self,
        spec: &TransferJobSpec,
        credentials: &AwsCredentials,
    ) -> Result<JobHandle, HarvestError>;
    fn poll(&self, handle: &JobHandle) -> Result<TransferStatus, HarvestError>;
}

/// Bucket holding the transfer manifests.
pub trait ManifestStore: Send + Sync {
    fn upload(&self, bucket: &str, object: &str, body: &str) -> Result<(), HarvestError>;
}

/// Polls `handle` every `interval` until the job is done. A job that finishes
/// with any status other than SUCCESS is an error carrying the job's properties.
pub fn wait_for_job<T: TransferClient + ?Sized>(
    client: &T,
    spec: &TransferJobSpec,
    handle: &JobHandle,
    interval: Duration,
) -> Result<TransferStatus, HarvestError> {
    info!(job = spec.name.as_str(), "waiting for transfer job to complete");
    loop {
        let status = client.poll(handle)?;
        if status.done {
            if status.state != TransferState::Success {
                error!(
                    job = spec.name.as_str(),
                    status = status.status.as_str(),
                    "transfer operation failed"
                );
                return Err(HarvestError::TransferFailed {
                    job: spec.name.clone(),
                    status: status.status,
                    source_bucket: spec.source_bucket.clone(),
                    destination_bucket: spec.destination_bucket.clone(),
                    manifest: spec.manifest_location(),
                });
            }
            info!(job = spec.name.as_str(), "transfer completed successfully");
            return Ok(status);
        }
        info!(
            job = spec.name.as_str(),
            status = status.status.as_str(),
            "transfer still running"
        );
        thread::sleep(interval);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    name: String,
    #[serde(default)]
    latest_operation_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationResource {
    #[serde(default)]
    done: bool,
    #[serde(default)]
    metadata: Option<OperationMetadata>,
}

#[derive(Debug, Deserialize)]
struct OperationMetadata {
    #[serde(default)]
    status: Option<String>,
}

/// Storage Transfer Service and Cloud Storage over their REST APIs. The bearer
/// token is only required once a request is actually made.
#[derive(Clone)]
pub struct GoogleCloudClient {
    client: Client,
    access_token: Option<String>,
}

impl GoogleCloudClient {
    pub fn new(access_token: Option<String>) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("portal-harvester/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::TransferHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| HarvestError::TransferHttp(err.to_string()))?;
        Ok(Self {
            client,
            access_token,
        })
    }

    pub fn from_env() -> Result<Self, HarvestError> {
        Self::new(std::env::var(ACCESS_TOKEN_VAR).ok())
    }

    fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, HarvestError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| HarvestError::MissingCredentials(ACCESS_TOKEN_VAR.to_string()))?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    fn handle_status(response: Response) -> Result<Response, HarvestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "transfer service request failed".to_string());
        Err(HarvestError::TransferStatus { status, message })
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HarvestError> {
        let response = self
            .request(Method::GET, url)?
            .send()
            .map_err(|err| HarvestError::TransferHttp(err.to_string()))?;
        Self::handle_status(response)?
            .json()
            .map_err(|err| HarvestError::TransferHttp(err.to_string()))
    }
}

impl TransferClient for GoogleCloudClient {
    fn submit(
        &self,
        spec: &TransferJobSpec,
        credentials: &AwsCredentials,
    ) -> Result<JobHandle, HarvestError> {
        let response = self
            .request(Method::POST, &format!("{TRANSFER_API}/transferJobs"))?
            .json(&spec.request_body(credentials))
            .send()
            .map_err(|err| HarvestError::TransferHttp(err.to_string()))?;
        let job: JobResource = Self::handle_status(response)?
            .json()
            .map_err(|err| HarvestError::TransferHttp(err.to_string()))?;
        info!(job = job.name.as_str(), "created transfer job");
        Ok(JobHandle {
            name: job.name,
            project_id: spec.project_id.clone(),
        })
    }

    fn poll(&self, handle: &JobHandle) -> Result<TransferStatus, HarvestError> {
        let job: JobResource = self.get_json(&format!(
            "{TRANSFER_API}/{}?projectId={}",
            handle.name, handle.project_id
        ))?;
        let Some(operation_name) = job.latest_operation_name else {
            return Ok(TransferStatus {
                done: false,
                state: TransferState::Queued,
                status: "WAITING_FOR_OPERATION".to_string(),
            });
        };
        let operation: OperationResource =
            self.get_json(&format!("{TRANSFER_API}/{operation_name}"))?;
        let status = operation
            .metadata
            .and_then(|metadata| metadata.status)
            .unwrap_or_else(|| "UNKNOWN".to_string());
        Ok(TransferStatus {
            done: operation.done,
            state: TransferState::from_operation_status(&status),
            status,
        })
    }
}

impl ManifestStore for GoogleCloudClient {
    fn upload(&self, bucket: &str, object: &str, body: &str) -> Result<(), HarvestError> {
        info!(bucket, object, "uploading transfer manifest");
        let response = self
            .request(Method::POST, &format!("{STORAGE_UPLOAD_API}/b/{bucket}/o"))?
            .query(&[("uploadType", "media"), ("name", object)])
            .header(CONTENT_TYPE, "text/tab-separated-values")
            .body(body.to_string())
            .send()
            .map_err(|err| HarvestError::StorageHttp(err.to_string()))?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "manifest upload failed".to_string());
        Err(HarvestError::StorageStatus { status, message })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn spec() -> TransferJobSpec {
        let created_at = Local.with_ymd_and_hms(2025, 3, 18, 9, 5, 7).unwrap();
        TransferJobSpec {
            name: job_name("igvf-anvil-gru", "igvf-files", created_at),
            project_id: "project-1".to_string(),
            source_bucket: "igvf-files".to_string(),
            destination_bucket: "fc-secure-1".to_string(),
            manifest_bucket: "manifests".to_string(),
            created_at,
        }
    }

    #[test]
    fn job_name_embeds_bucket_and_timestamp() {
        assert_eq!(spec().name, "igvf-anvil-gru-igvf-files-2025-03-18-09-05-07");
        assert_eq!(
            spec().manifest_location(),
            "gs://manifests/igvf-anvil-gru-igvf-files-2025-03-18-09-05-07.tsv"
        );
    }

    #[test]
    fn request_body_schedules_single_day() {
        let credentials = AwsCredentials {
            access_key_id: "AKIA".to_string(),
            secret_access_key: "secret".to_string(),
        };
        let body = spec().request_body(&credentials);
        assert_eq!(body["schedule"]["scheduleStartDate"]["day"], 18);
        assert_eq!(body["schedule"]["scheduleEndDate"]["month"], 3);
        assert_eq!(
            body["transferSpec"]["awsS3DataSource"]["bucketName"],
            "igvf-files"
        );
        assert_eq!(
            body["transferSpec"]["transferManifest"]["location"],
            spec().manifest_location()
        );
    }

    #[test]
    fn operation_status_mapping() {
        assert_eq!(
            TransferState::from_operation_status("SUCCESS"),
            TransferState::Success
        );
        assert_eq!(
            TransferState::from_operation_status("ABORTED"),
            TransferState::Failed
        );
        assert_eq!(
            TransferState::from_operation_status("IN_PROGRESS"),
            TransferState::Running
        );
    }
}
