use std::env;

/// Default GCP project, e.g. `my-project`.
pub const PROJECT_ENV_VAR: &str = "KERAS_REMOTE_PROJECT";
/// Secondary project fallback, shared with the rest of the Google tooling.
pub const GOOGLE_PROJECT_ENV_VAR: &str = "GOOGLE_CLOUD_PROJECT";
/// Default GCP zone, e.g. `us-central1-a`.
pub const ZONE_ENV_VAR: &str = "KERAS_REMOTE_ZONE";
/// Default GKE cluster name.
pub const CLUSTER_ENV_VAR: &str = "KERAS_REMOTE_CLUSTER";
/// Default Kubernetes namespace.
pub const NAMESPACE_ENV_VAR: &str = "KERAS_REMOTE_NAMESPACE";

pub const DEFAULT_ZONE: &str = "us-central1-a";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Zone from `KERAS_REMOTE_ZONE`, or the default zone.
pub fn default_zone() -> String {
    env::var(ZONE_ENV_VAR).unwrap_or_else(|_| DEFAULT_ZONE.to_string())
}

/// Project resolution order: caller-provided, then `KERAS_REMOTE_PROJECT`,
/// then `GOOGLE_CLOUD_PROJECT`.
pub fn resolve_project(explicit: Option<&str>) -> Option<String> {
    if let Some(project) = explicit {
        if !project.is_empty() {
            return Some(project.to_string());
        }
    }

    env::var(PROJECT_ENV_VAR)
        .or_else(|_| env::var(GOOGLE_PROJECT_ENV_VAR))
        .ok()
        .filter(|p| !p.is_empty())
}

/// Convert a GCP zone to its region (e.g. `us-central1-a` -> `us-central1`).
pub fn zone_to_region(zone: &str) -> String {
    match zone.rsplit_once('-') {
        Some((region, _)) => region.to_string(),
        None => DEFAULT_ZONE.rsplit_once('-').map(|(r, _)| r).unwrap_or_default().to_string(),
    }
}

/// Convert a GCP zone to its Artifact Registry multi-region
/// (e.g. `us-central1-a` -> `us`).
pub fn zone_to_ar_location(zone: &str) -> String {
    let region = zone_to_region(zone);
    match region.split_once('-') {
        Some((location, _)) => location.to_string(),
        None => region,
    }
}
