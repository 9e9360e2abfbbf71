use crate::runtime::block_on;
use google_cloud_auth::project::Config;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const CLOUD_BUILD_ENDPOINT: &str = "https://cloudbuild.googleapis.com/v1";
const CLOUD_PLATFORM_SCOPE: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// Poll cadence while a remote build is running.
const BUILD_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Error, Debug)]
pub enum CloudBuildServiceError {
    #[error("Cannot create cloud build service: {raw_error_message:?}")]
    CannotCreateService { raw_error_message: String },
    #[error("Cannot submit build to project `{project_id}`: {raw_error_message:?}")]
    CannotCreateBuild {
        project_id: String,
        raw_error_message: String,
    },
    #[error("Cannot get build `{build_id}`: {raw_error_message:?}")]
    CannotGetBuild {
        build_id: String,
        raw_error_message: String,
    },
    #[error("Build `{build_id}` did not complete within {timeout_secs}s")]
    BuildTimedOut { build_id: String, timeout_secs: u64 },
}

#[derive(Serialize, Debug, Clone)]
pub struct BuildStep {
    pub name: String,
    pub args: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StorageSource {
    pub bucket: String,
    pub object: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BuildSource {
    pub storage_source: StorageSource,
}

/// Request body for `projects.builds.create`.
#[derive(Serialize, Debug, Clone)]
pub struct BuildRequest {
    pub steps: Vec<BuildStep>,
    pub images: Vec<String>,
    pub source: BuildSource,
}

#[derive(Deserialize, Debug)]
struct BuildResource {
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize, Debug)]
struct OperationMetadata {
    build: Option<BuildResource>,
}

#[derive(Deserialize, Debug)]
struct Operation {
    metadata: Option<OperationMetadata>,
}

/// Thin REST client for Cloud Build: one `create`, one `get`, and a bounded
/// poll loop. Tokens come from ambient Google credentials.
#[cfg_attr(test, faux::create)]
pub struct CloudBuildService {
    http: reqwest::blocking::Client,
    token_source: Arc<dyn TokenSource>,
}

#[cfg_attr(test, faux::methods)]
impl CloudBuildService {
    pub fn new() -> Result<Self, CloudBuildServiceError> {
        let token_provider = block_on(DefaultTokenSourceProvider::new(
            Config::default().with_scopes(CLOUD_PLATFORM_SCOPE),
        ))
        .map_err(|e| CloudBuildServiceError::CannotCreateService {
            raw_error_message: e.to_string(),
        })?;

        Ok(Self {
            http: reqwest::blocking::Client::new(),
            token_source: token_provider.token_source(),
        })
    }

    fn bearer_token(&self) -> Result<String, String> {
        block_on(self.token_source.token()).map_err(|e| e.to_string())
    }

    /// Submit a build and return its build id.
    pub fn create_build(&self, project_id: &str, request: &BuildRequest) -> Result<String, CloudBuildServiceError> {
        let to_error = |raw_error_message: String| CloudBuildServiceError::CannotCreateBuild {
            project_id: project_id.to_string(),
            raw_error_message,
        };

        let token = self.bearer_token().map_err(to_error)?;
        let response = self
            .http
            .post(format!("{CLOUD_BUILD_ENDPOINT}/projects/{project_id}/builds"))
            .header(reqwest::header::AUTHORIZATION, token)
            .json(request)
            .send()
            .map_err(|e| to_error(e.to_string()))?
            .error_for_status()
            .map_err(|e| to_error(e.to_string()))?;

        let operation: Operation = response.json().map_err(|e| to_error(e.to_string()))?;
        match operation.metadata.and_then(|m| m.build) {
            Some(build) => Ok(build.id),
            None => Err(to_error("build operation carries no build metadata".to_string())),
        }
    }

    pub fn get_build_status(&self, project_id: &str, build_id: &str) -> Result<String, CloudBuildServiceError> {
        let to_error = |raw_error_message: String| CloudBuildServiceError::CannotGetBuild {
            build_id: build_id.to_string(),
            raw_error_message,
        };

        let token = self.bearer_token().map_err(to_error)?;
        let response = self
            .http
            .get(format!("{CLOUD_BUILD_ENDPOINT}/projects/{project_id}/builds/{build_id}"))
            .header(reqwest::header::AUTHORIZATION, token)
            .send()
            .map_err(|e| to_error(e.to_string()))?
            .error_for_status()
            .map_err(|e| to_error(e.to_string()))?;

        let build: BuildResource = response.json().map_err(|e| to_error(e.to_string()))?;
        Ok(build.status)
    }

    /// Block until the build reaches a terminal status or `timeout` elapses.
    pub fn wait_for_build(
        &self,
        project_id: &str,
        build_id: &str,
        timeout: Duration,
    ) -> Result<String, CloudBuildServiceError> {
        let started_at = Instant::now();

        loop {
            if started_at.elapsed() > timeout {
                return Err(CloudBuildServiceError::BuildTimedOut {
                    build_id: build_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }

            let status = self.get_build_status(project_id, build_id)?;
            match status.as_str() {
                "SUCCESS" | "FAILURE" | "INTERNAL_ERROR" | "TIMEOUT" | "CANCELLED" | "EXPIRED" => {
                    return Ok(status);
                }
                _ => {} // QUEUED / WORKING / PENDING
            }

            std::thread::sleep(BUILD_POLL_INTERVAL);
        }
    }
}
