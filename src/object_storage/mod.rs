use crate::runtime::block_on;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::Error as GcsError;
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{UploadObjectRequest, UploadType};
use google_cloud_storage::http::objects::Object as GcsObject;
use reqwest::Body;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Object names under the `{job_id}/` prefix.
pub const PAYLOAD_OBJECT: &str = "payload.json";
pub const CONTEXT_OBJECT: &str = "context.tar.gz";
pub const RESULT_OBJECT: &str = "result.json";

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum ObjectStorageServiceError {
    #[error("Cannot create object storage service: {raw_error_message:?}")]
    CannotCreateService { raw_error_message: String },
    #[error("Cannot put object `{object_key}` to bucket `{bucket_name}`: {raw_error_message:?}")]
    CannotPutObjectToBucket {
        object_key: String,
        bucket_name: String,
        raw_error_message: String,
    },
    #[error("Cannot get object `{object_key}` from bucket `{bucket_name}`: {raw_error_message:?}")]
    CannotGetObject {
        object_key: String,
        bucket_name: String,
        raw_error_message: String,
    },
    #[error("Object `{object_key}` not found in bucket `{bucket_name}`")]
    ObjectNotFound { object_key: String, bucket_name: String },
    #[error("Cannot delete object `{object_key}` from bucket `{bucket_name}`: {raw_error_message:?}")]
    CannotDeleteObject {
        object_key: String,
        bucket_name: String,
        raw_error_message: String,
    },
    #[error("Cannot list objects from bucket `{bucket_name}`: {raw_error_message:?}")]
    CannotListObjects {
        bucket_name: String,
        raw_error_message: String,
    },
    #[error("Invalid object storage URI `{uri}`")]
    InvalidUri { uri: String },
    #[error("Cannot read local file `{path}`: {raw_error_message:?}")]
    CannotReadLocalFile { path: String, raw_error_message: String },
    #[error("Cannot write local file `{path}`: {raw_error_message:?}")]
    CannotWriteLocalFile { path: String, raw_error_message: String },
}

/// `gs://{bucket}/{key}`
pub fn gs_uri(bucket_name: &str, object_key: &str) -> String {
    format!("gs://{bucket_name}/{object_key}")
}

pub fn job_object_key(job_id: &str, object_name: &str) -> String {
    format!("{job_id}/{object_name}")
}

/// Split a `gs://bucket/key` URI into bucket and key.
pub fn parse_gs_uri(uri: &str) -> Result<(String, String), ObjectStorageServiceError> {
    let invalid = || ObjectStorageServiceError::InvalidUri { uri: uri.to_string() };

    let remainder = uri.strip_prefix("gs://").ok_or_else(invalid)?;
    match remainder.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket.to_string(), key.to_string())),
        _ => Err(invalid()),
    }
}

fn is_not_found(error: &GcsError) -> bool {
    match error {
        GcsError::Response(response) => response.code == 404,
        GcsError::HttpClient(e) => e.status().map(|s| s.as_u16() == 404).unwrap_or(false),
        _ => false,
    }
}

#[cfg_attr(test, faux::create)]
pub struct ObjectStorageService {
    client: Client,
}

#[cfg_attr(test, faux::methods)]
impl ObjectStorageService {
    /// Build a client from ambient Google credentials (application default
    /// credentials locally, workload identity in-cluster).
    pub fn new() -> Result<Self, ObjectStorageServiceError> {
        let config = block_on(ClientConfig::default().with_auth()).map_err(|e| {
            ObjectStorageServiceError::CannotCreateService {
                raw_error_message: e.to_string(),
            }
        })?;

        Ok(Self {
            client: Client::new(config),
        })
    }

    pub fn put_object(
        &self,
        bucket_name: &str,
        object_key: &str,
        content: Vec<u8>,
    ) -> Result<(), ObjectStorageServiceError> {
        match block_on(self.client.upload_object(
            &UploadObjectRequest {
                bucket: bucket_name.to_string(),
                ..Default::default()
            },
            Body::from(content),
            &UploadType::Multipart(Box::new(GcsObject {
                name: object_key.to_string(),
                ..Default::default()
            })),
        )) {
            Ok(_) => Ok(()),
            Err(e) => Err(ObjectStorageServiceError::CannotPutObjectToBucket {
                bucket_name: bucket_name.to_string(),
                object_key: object_key.to_string(),
                raw_error_message: e.to_string(),
            }),
        }
    }

    pub fn get_object(&self, bucket_name: &str, object_key: &str) -> Result<Vec<u8>, ObjectStorageServiceError> {
        let object_request = GetObjectRequest {
            bucket: bucket_name.to_string(),
            object: object_key.to_string(),
            ..Default::default()
        };

        block_on(self.client.download_object(&object_request, &Range(None, None))).map_err(|e| {
            if is_not_found(&e) {
                ObjectStorageServiceError::ObjectNotFound {
                    bucket_name: bucket_name.to_string(),
                    object_key: object_key.to_string(),
                }
            } else {
                ObjectStorageServiceError::CannotGetObject {
                    bucket_name: bucket_name.to_string(),
                    object_key: object_key.to_string(),
                    raw_error_message: e.to_string(),
                }
            }
        })
    }

    pub fn delete_object(&self, bucket_name: &str, object_key: &str) -> Result<(), ObjectStorageServiceError> {
        block_on(self.client.delete_object(&DeleteObjectRequest {
            bucket: bucket_name.to_string(),
            object: object_key.to_string(),
            ..Default::default()
        }))
        .map_err(|e| ObjectStorageServiceError::CannotDeleteObject {
            bucket_name: bucket_name.to_string(),
            object_key: object_key.to_string(),
            raw_error_message: e.to_string(),
        })
    }

    pub fn list_objects_keys_only(
        &self,
        bucket_name: &str,
        object_key_prefix: Option<&str>,
    ) -> Result<Vec<String>, ObjectStorageServiceError> {
        let mut objects: Vec<String> = vec![];
        let mut next_page_token: Option<String> = None;

        loop {
            match block_on(self.client.list_objects(&ListObjectsRequest {
                page_token: next_page_token,
                bucket: bucket_name.to_string(),
                prefix: object_key_prefix.map(str::to_string),
                max_results: Some(1000),
                ..Default::default()
            })) {
                Ok(objects_list_response) => {
                    next_page_token = objects_list_response.next_page_token;
                    if let Some(new_objects) = objects_list_response.items {
                        objects.extend(new_objects.iter().map(|o| o.name.to_string()));
                    }

                    if next_page_token.is_none() {
                        break;
                    }
                }
                Err(e) => {
                    return Err(ObjectStorageServiceError::CannotListObjects {
                        bucket_name: bucket_name.to_string(),
                        raw_error_message: e.to_string(),
                    });
                }
            }
        }

        Ok(objects)
    }

    /// Download `bucket/key` straight to a local file.
    pub fn download_to_file(
        &self,
        bucket_name: &str,
        object_key: &str,
        local_path: &Path,
    ) -> Result<(), ObjectStorageServiceError> {
        let content = self.get_object(bucket_name, object_key)?;
        std::fs::write(local_path, content).map_err(|e| ObjectStorageServiceError::CannotWriteLocalFile {
            path: local_path.to_string_lossy().to_string(),
            raw_error_message: e.to_string(),
        })
    }

    /// Upload a local file to `bucket/key`.
    pub fn upload_from_file(
        &self,
        bucket_name: &str,
        object_key: &str,
        local_path: &Path,
    ) -> Result<(), ObjectStorageServiceError> {
        let content = std::fs::read(local_path).map_err(|e| ObjectStorageServiceError::CannotReadLocalFile {
            path: local_path.to_string_lossy().to_string(),
            raw_error_message: e.to_string(),
        })?;

        self.put_object(bucket_name, object_key, content)
    }

    /// Phase 3: stage the payload and context objects under `{job_id}/`.
    pub fn upload_artifacts(
        &self,
        bucket_name: &str,
        job_id: &str,
        payload_path: &Path,
        context_path: &Path,
        project: &str,
    ) -> Result<(), ObjectStorageServiceError> {
        let payload_key = job_object_key(job_id, PAYLOAD_OBJECT);
        self.upload_from_file(bucket_name, &payload_key, payload_path)?;
        info!("Uploaded payload to {}", gs_uri(bucket_name, &payload_key));

        let context_key = job_object_key(job_id, CONTEXT_OBJECT);
        self.upload_from_file(bucket_name, &context_key, context_path)?;
        info!("Uploaded context to {}", gs_uri(bucket_name, &context_key));

        info!(
            "View artifacts: https://console.cloud.google.com/storage/browser/{}/{}?project={}",
            bucket_name, job_id, project
        );

        Ok(())
    }

    /// Phase 6: fetch the result envelope written by the remote runner.
    /// Fails with `ObjectNotFound` if the runner never uploaded one.
    pub fn download_result(&self, bucket_name: &str, job_id: &str) -> Result<PathBuf, ObjectStorageServiceError> {
        let result_key = job_object_key(job_id, RESULT_OBJECT);
        let local_path = std::env::temp_dir().join(format!("result-{job_id}.json"));

        self.download_to_file(bucket_name, &result_key, &local_path)?;
        info!("Downloaded result from {}", gs_uri(bucket_name, &result_key));

        Ok(local_path)
    }

    /// Phase 7: delete every object under the `{job_id}/` prefix. A missing
    /// prefix is a success.
    pub fn cleanup_artifacts(&self, bucket_name: &str, job_id: &str) -> Result<usize, ObjectStorageServiceError> {
        let prefix = format!("{job_id}/");
        let keys = self.list_objects_keys_only(bucket_name, Some(&prefix))?;

        let mut deleted_count = 0usize;
        for key in keys {
            self.delete_object(bucket_name, &key)?;
            deleted_count += 1;
        }

        if deleted_count > 0 {
            info!("Cleaned up {} artifacts from {}", deleted_count, gs_uri(bucket_name, &prefix));
        }

        Ok(deleted_count)
    }
}
