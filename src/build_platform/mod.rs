pub mod cloud_build;

use crate::accelerator::AcceleratorCategory;
use crate::build_platform::cloud_build::{
    BuildRequest, BuildSource, BuildStep, CloudBuildService, CloudBuildServiceError, StorageSource,
};
use crate::container_registry::{ArtifactRegistryService, ArtifactRegistryServiceError};
use crate::object_storage::{ObjectStorageService, ObjectStorageServiceError};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tera::{Context as TeraContext, Tera};
use thiserror::Error;

/// Runner base image published alongside the crate; ships python3 and the
/// compiled /app/remote_runner entrypoint. Callers override per job via
/// `container_image`.
pub const DEFAULT_BASE_IMAGE: &str = "us-docker.pkg.dev/keras-remote-images/runner/base:latest";

/// Remote builds are bounded; past this the build is reported failed.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(20 * 60);

const DOCKERFILE_TEMPLATE: &str = include_str!("../../templates/Dockerfile.j2");
const REMOTE_RUNNER_SOURCE: &str = include_str!("../runner/mod.rs");
const REMOTE_RUNNER_FILE_NAME: &str = "remote_runner.rs";
const DOCKER_BUILDER_IMAGE: &str = "gcr.io/cloud-builders/docker";

#[derive(Clone, Error, Debug)]
pub enum BuildError {
    #[error("Cannot render Dockerfile: {raw_error_message:?}")]
    CannotRenderDockerfile { raw_error_message: String },
    #[error("Cannot stage build source: {raw_error_message:?}")]
    CannotStageBuildSource { raw_error_message: String },
    #[error("Cannot upload build source: {0}")]
    CannotUploadBuildSource(#[from] ObjectStorageServiceError),
    #[error("Cannot submit build: {0}")]
    CannotSubmitBuild(#[from] CloudBuildServiceError),
    #[error("Build `{build_id}` failed with status `{status}`")]
    BuildFailed { build_id: String, status: String },
}

/// Bucket holding transient build-source tarballs.
pub fn build_source_bucket(project_id: &str) -> String {
    format!("{project_id}-keras-remote-builds")
}

/// Deterministic content hash over everything that shapes the image: base
/// image, accelerator, requirements manifest, runner source and Dockerfile
/// template. Identical inputs always map to the same tag, which makes
/// rebuild-and-push idempotent.
pub fn image_content_hash(base_image: &str, accelerator_name: &str, requirements: Option<&str>) -> String {
    let mut content = format!("base_image={base_image}\naccelerator={accelerator_name}\n");

    if let Some(requirements) = requirements {
        content.push_str(requirements);
    }

    content.push_str(&format!("\n---{REMOTE_RUNNER_FILE_NAME}---\n{REMOTE_RUNNER_SOURCE}"));
    content.push_str(&format!("\n---Dockerfile.template---\n{DOCKERFILE_TEMPLATE}"));

    hex::encode(Sha256::digest(content.as_bytes()))
}

/// `{ar_location}-docker.pkg.dev/{project}/keras-remote/base:{accel}-{hash12}`
pub fn image_uri(ar_location: &str, project_id: &str, accelerator_name: &str, content_hash: &str) -> String {
    let sanitized_accelerator = accelerator_name.replace([':', '/'], "-");
    format!(
        "{ar_location}-docker.pkg.dev/{project_id}/{repository}/{image}:{sanitized_accelerator}-{hash12}",
        repository = crate::container_registry::IMAGE_REPOSITORY,
        image = crate::container_registry::IMAGE_NAME,
        hash12 = &content_hash[..12],
    )
}

pub fn image_tag(accelerator_name: &str, content_hash: &str) -> String {
    let sanitized_accelerator = accelerator_name.replace([':', '/'], "-");
    format!("{sanitized_accelerator}-{hash12}", hash12 = &content_hash[..12])
}

fn accelerator_install(category: AcceleratorCategory) -> &'static str {
    match category {
        AcceleratorCategory::Cpu => "RUN python3 -m pip install --no-cache-dir jax",
        AcceleratorCategory::Tpu => {
            "RUN python3 -m pip install --no-cache-dir 'jax[tpu]>=0.4.6' -f https://storage.googleapis.com/jax-releases/libtpu_releases.html"
        }
        AcceleratorCategory::Gpu => "RUN python3 -m pip install --no-cache-dir 'jax[cuda12]'",
    }
}

fn render_dockerfile(
    base_image: &str,
    category: AcceleratorCategory,
    with_requirements: bool,
) -> Result<String, BuildError> {
    let mut context = TeraContext::new();
    context.insert("base_image", base_image);
    context.insert("accelerator_install", accelerator_install(category));
    context.insert("with_requirements", &with_requirements);

    Tera::one_off(DOCKERFILE_TEMPLATE, &context, false).map_err(|e| BuildError::CannotRenderDockerfile {
        raw_error_message: e.to_string(),
    })
}

/// Dockerfile + runner source + optional requirements, gzipped for Cloud
/// Build's storage source.
fn stage_build_source(dockerfile: &str, requirements: Option<&str>) -> Result<Vec<u8>, BuildError> {
    let to_error = |e: &dyn std::fmt::Display| BuildError::CannotStageBuildSource {
        raw_error_message: e.to_string(),
    };

    let append_file = |tar: &mut tar::Builder<flate2::write::GzEncoder<Vec<u8>>>,
                       name: &str,
                       content: &str|
     -> Result<(), BuildError> {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, name, content.as_bytes()).map_err(|e| to_error(&e))
    };

    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    let mut tar = tar::Builder::new(encoder);

    append_file(&mut tar, "Dockerfile", dockerfile)?;
    append_file(&mut tar, REMOTE_RUNNER_FILE_NAME, REMOTE_RUNNER_SOURCE)?;
    if let Some(requirements) = requirements {
        append_file(&mut tar, "requirements.txt", requirements)?;
    }

    tar.into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| to_error(&e))
}

#[cfg_attr(test, faux::create)]
pub struct ImageBuilder {
    registry: ArtifactRegistryService,
    storage: Arc<ObjectStorageService>,
    cloud_build: CloudBuildService,
}

#[cfg_attr(test, faux::methods)]
impl ImageBuilder {
    pub fn new(
        registry: ArtifactRegistryService,
        storage: Arc<ObjectStorageService>,
        cloud_build: CloudBuildService,
    ) -> Self {
        Self {
            registry,
            storage,
            cloud_build,
        }
    }

    /// Return the URI of a cached image matching the inputs, or drive a
    /// remote build producing it. A registry lookup failure only costs a
    /// rebuild: hashing is deterministic and pushing a tag is idempotent.
    pub fn get_or_build(
        &self,
        base_image: &str,
        requirements_path: Option<&Path>,
        accelerator_name: &str,
        category: AcceleratorCategory,
        project_id: &str,
        zone: &str,
    ) -> Result<String, BuildError> {
        let ar_location = crate::constants::zone_to_ar_location(zone);

        let requirements = requirements_path.and_then(|path| std::fs::read_to_string(path).ok());
        let content_hash = image_content_hash(base_image, accelerator_name, requirements.as_deref());
        let image_uri = image_uri(&ar_location, project_id, accelerator_name, &content_hash);
        let tag = image_tag(accelerator_name, &content_hash);

        match self.registry.image_tag_exists(project_id, &ar_location, &tag) {
            Ok(true) => {
                info!("Using cached container: {}", image_uri);
                return Ok(image_uri);
            }
            Ok(false) => {}
            Err(ArtifactRegistryServiceError::CannotGetTag { raw_error_message, .. }) => {
                // Treated as a cache miss: rebuilding is safe, only slower.
                warn!("Unexpected error checking image existence: {}", raw_error_message);
            }
            Err(e) => {
                warn!("Unexpected error checking image existence: {}", e);
            }
        }

        info!("Building new container: {}", image_uri);
        self.build_and_push(
            base_image,
            requirements.as_deref(),
            category,
            project_id,
            &image_uri,
            &ar_location,
        )
    }

    fn build_and_push(
        &self,
        base_image: &str,
        requirements: Option<&str>,
        category: AcceleratorCategory,
        project_id: &str,
        image_uri: &str,
        ar_location: &str,
    ) -> Result<String, BuildError> {
        let dockerfile = render_dockerfile(base_image, category, requirements.is_some())?;
        let source_tarball = stage_build_source(&dockerfile, requirements)?;

        let bucket_name = build_source_bucket(project_id);
        let object_key = format!("source-{}.tar.gz", chrono::Utc::now().timestamp());
        self.storage.put_object(&bucket_name, &object_key, source_tarball)?;
        info!("Uploaded build source to gs://{}/{}", bucket_name, object_key);

        let build_request = BuildRequest {
            steps: vec![BuildStep {
                name: DOCKER_BUILDER_IMAGE.to_string(),
                args: vec!["build".to_string(), "-t".to_string(), image_uri.to_string(), ".".to_string()],
            }],
            images: vec![image_uri.to_string()],
            source: BuildSource {
                storage_source: StorageSource {
                    bucket: bucket_name,
                    object: object_key,
                },
            },
        };

        let build_id = self.cloud_build.create_build(project_id, &build_request)?;
        info!(
            "Building container image, build id {} (this may take 5-10 minutes): https://console.cloud.google.com/cloud-build/builds/{}?project={}",
            build_id, build_id, project_id
        );

        let status = self.cloud_build.wait_for_build(project_id, &build_id, BUILD_TIMEOUT)?;
        if status != "SUCCESS" {
            return Err(BuildError::BuildFailed { build_id, status });
        }

        info!(
            "Container built successfully: {} (view: https://console.cloud.google.com/artifacts/docker/{}/{}/{}/{}?project={})",
            image_uri,
            project_id,
            ar_location,
            crate::container_registry::IMAGE_REPOSITORY,
            crate::container_registry::IMAGE_NAME,
            project_id
        );
        Ok(image_uri.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_content_hash_is_deterministic() {
        let first = image_content_hash("python:3.12-slim", "v3-8", Some("jax==0.4.30\n"));
        let second = image_content_hash("python:3.12-slim", "v3-8", Some("jax==0.4.30\n"));

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_image_content_hash_is_sensitive_to_each_input() {
        let reference = image_content_hash("python:3.12-slim", "v3-8", Some("jax\n"));

        assert_ne!(reference, image_content_hash("python:3.13-slim", "v3-8", Some("jax\n")));
        assert_ne!(reference, image_content_hash("python:3.12-slim", "l4", Some("jax\n")));
        assert_ne!(reference, image_content_hash("python:3.12-slim", "v3-8", Some("jax==0.4.30\n")));
        assert_ne!(reference, image_content_hash("python:3.12-slim", "v3-8", None));
    }

    #[test]
    fn test_image_uri_layout() {
        let hash = image_content_hash("python:3.12-slim", "v3-8", None);
        let uri = image_uri("us", "my-project", "v3-8", &hash);

        assert!(uri.starts_with("us-docker.pkg.dev/my-project/keras-remote/base:v3-8-"));
        let tag = uri.rsplit(':').next().unwrap();
        assert_eq!(tag.len(), "v3-8-".len() + 12);
    }

    #[test]
    fn test_image_uri_sanitizes_accelerator_name() {
        let hash = image_content_hash("base", "custom:accel/name", None);
        let uri = image_uri("us", "my-project", "custom:accel/name", &hash);

        assert!(uri.contains(":custom-accel-name-"));
    }

    #[test]
    fn test_render_dockerfile_with_requirements() {
        let dockerfile =
            render_dockerfile("python:3.12-slim", AcceleratorCategory::Tpu, true).expect("render should succeed");

        assert!(dockerfile.contains("FROM python:3.12-slim"));
        assert!(dockerfile.contains("jax[tpu]"));
        assert!(dockerfile.contains("COPY requirements.txt /app/requirements.txt"));
        assert!(dockerfile.contains("ENTRYPOINT [\"/app/remote_runner\"]"));
    }

    #[test]
    fn test_render_dockerfile_without_requirements() {
        let dockerfile =
            render_dockerfile("python:3.12-slim", AcceleratorCategory::Cpu, false).expect("render should succeed");

        assert!(!dockerfile.contains("requirements.txt"));
        assert!(dockerfile.contains("pip install --no-cache-dir jax"));
    }

    #[test]
    fn test_get_or_build_returns_cached_image() {
        let mut registry = ArtifactRegistryService::faux();
        faux::when!(registry.image_tag_exists).then_return(Ok(true));
        let storage = Arc::new(ObjectStorageService::faux());
        let cloud_build = CloudBuildService::faux();

        let builder = ImageBuilder::new(registry, storage, cloud_build);
        let uri = builder
            .get_or_build("python:3.12-slim", None, "l4", AcceleratorCategory::Gpu, "my-project", "us-central1-a")
            .expect("cached lookup should succeed");

        assert!(uri.starts_with("us-docker.pkg.dev/my-project/keras-remote/base:l4-"));
    }
}
