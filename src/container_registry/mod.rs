use crate::runtime::block_on;
use google_cloud_artifact_registry::client::{Client, ClientConfig};
use google_cloud_googleapis::devtools::artifact_registry::v1::GetTagRequest;
use std::borrow::BorrowMut;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Repository holding all remote-execution base images.
pub const IMAGE_REPOSITORY: &str = "keras-remote";
pub const IMAGE_NAME: &str = "base";

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum ArtifactRegistryServiceError {
    #[error("Cannot create artifact registry service: {raw_error_message:?}")]
    CannotCreateService { raw_error_message: String },
    #[error("Cannot get tag `{image_tag}` for image `{repository_name}/{image_name}`: {raw_error_message:?}")]
    CannotGetTag {
        repository_name: String,
        image_name: String,
        image_tag: String,
        raw_error_message: String,
    },
}

#[cfg_attr(test, faux::create)]
pub struct ArtifactRegistryService {
    client: Arc<Mutex<Client>>,
}

#[cfg_attr(test, faux::methods)]
impl ArtifactRegistryService {
    /// Build a client from ambient Google credentials.
    pub fn new() -> Result<Self, ArtifactRegistryServiceError> {
        let config = block_on(ClientConfig::default().with_auth()).map_err(|e| {
            ArtifactRegistryServiceError::CannotCreateService {
                raw_error_message: e.to_string(),
            }
        })?;

        Ok(Self {
            client: Arc::new(Mutex::from(block_on(Client::new(config)).map_err(|e| {
                ArtifactRegistryServiceError::CannotCreateService {
                    raw_error_message: e.to_string(),
                }
            })?)),
        })
    }

    /// Check whether `tag` exists on the base image. The lookup goes against
    /// the tag resource by name: dockerImages resources are keyed by digest
    /// and cannot resolve `image:tag` URIs.
    pub fn image_tag_exists(
        &self,
        project_id: &str,
        location: &str,
        image_tag: &str,
    ) -> Result<bool, ArtifactRegistryServiceError> {
        let tag_identifier = format!(
            "projects/{project_id}/locations/{location}/repositories/{IMAGE_REPOSITORY}/packages/{IMAGE_NAME}/tags/{image_tag}"
        );

        match block_on(self.client.clone().blocking_lock_owned().borrow_mut().get_package_tag(
            GetTagRequest {
                name: tag_identifier.to_string(),
            },
            None,
        )) {
            Ok(_) => Ok(true),
            Err(status) if status.code() == google_cloud_gax::grpc::Code::NotFound => Ok(false),
            Err(status) => Err(ArtifactRegistryServiceError::CannotGetTag {
                repository_name: IMAGE_REPOSITORY.to_string(),
                image_name: IMAGE_NAME.to_string(),
                image_tag: image_tag.to_string(),
                raw_error_message: status.to_string(),
            }),
        }
    }
}
