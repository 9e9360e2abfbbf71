use crate::accelerator::Accelerator;
use crate::errors::RemoteError;
use crate::execution::JobContext;
use crate::kubernetes::{
    JOB_POLL_INTERVAL, JOB_WAIT_TIMEOUT, JobBackend, JobHandle, build_pod_spec, check_pod_scheduling,
    is_kube_not_found, kube_client, log_streaming, tail_pod_logs,
};
use crate::runtime::block_on;
use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, ObjectFieldSelector, Pod};
use kube::Api;
use kube::api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, PostParams};
use serde_json::{Value, json};
use std::time::Instant;

pub const LWS_GROUP: &str = "leaderworkerset.x-k8s.io";
/// Pinned fallback when API-group discovery fails.
pub const LWS_VERSION: &str = "v1";
pub const LWS_PLURAL: &str = "leaderworkersets";
pub const LWS_KIND: &str = "LeaderWorkerSet";

/// TPU slices spanning several VMs, scheduled as one leader plus N-1 workers
/// through the cluster's LeaderWorkerSet custom resource.
pub struct LeaderWorkerBackend {
    cluster: Option<String>,
    namespace: String,
}

impl LeaderWorkerBackend {
    pub fn new(cluster: Option<String>, namespace: String) -> Self {
        LeaderWorkerBackend { cluster, namespace }
    }
}

pub fn job_name(job_id: &str) -> String {
    format!("keras-pathways-{job_id}")
}

/// The leader pod carries the `-0` suffix.
pub fn leader_pod_name(job_id: &str) -> String {
    format!("{}-0", job_name(job_id))
}

/// Ask the cluster for the preferred LeaderWorkerSet API version; fall back
/// to the pinned default when the group is absent or the lookup fails.
fn discover_lws_version(client: &kube::Client) -> String {
    let groups = match block_on(client.list_api_groups()) {
        Ok(group_list) => group_list.groups,
        Err(e) => {
            warn!("Failed to retrieve LWS API version from cluster, defaulting to '{}': {}", LWS_VERSION, e);
            return LWS_VERSION.to_string();
        }
    };

    for group in groups {
        if group.name == LWS_GROUP {
            if let Some(preferred) = group.preferred_version {
                return preferred.version;
            }
            if let Some(first) = group.versions.first() {
                return first.version.clone();
            }
        }
    }

    warn!("API group {} not found on cluster, defaulting to '{}'", LWS_GROUP, LWS_VERSION);
    LWS_VERSION.to_string()
}

fn slice_size(accelerator: &Accelerator) -> Result<u32, RemoteError> {
    match accelerator {
        Accelerator::Tpu(tpu) => Ok(tpu.num_nodes.max(1)),
        _ => Err(RemoteError::Config(
            "the leader-worker backend requires a TPU accelerator".to_string(),
        )),
    }
}

/// Environment contract of the custom resource: the leader address variable
/// it exports, the slice count, and the per-worker index label.
fn coordination_env(size: u32) -> Vec<EnvVar> {
    vec![
        EnvVar {
            name: "MEGASCALE_COORDINATOR_ADDRESS".to_string(),
            value: Some("$(LWS_LEADER_ADDRESS)".to_string()),
            value_from: None,
        },
        EnvVar {
            name: "MEGASCALE_NUM_SLICES".to_string(),
            value: Some(size.to_string()),
            value_from: None,
        },
        EnvVar {
            name: "TPU_WORKER_ID".to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.labels['leaderworkerset.sigs.k8s.io/worker-index']".to_string(),
                    api_version: None,
                }),
                ..Default::default()
            }),
        },
    ]
}

/// The LeaderWorkerSet manifest: one leader plus `size - 1` workers sharing
/// an identical pod template, recreated as a group if any member restarts.
pub fn build_lws_manifest(ctx: &JobContext, namespace: &str, version: &str) -> Result<Value, RemoteError> {
    let size = slice_size(&ctx.accelerator)?;
    let name = job_name(&ctx.job_id);

    // Restart handling belongs to the group, not to the individual pods.
    let mut pod_spec = build_pod_spec(ctx, coordination_env(size));
    pod_spec.restart_policy = None;

    let pod_template = json!({
        "metadata": {
            "labels": {
                "app": "keras-remote-pathways",
                "job-id": ctx.job_id,
                "job-name": name,
            }
        },
        "spec": serde_json::to_value(&pod_spec).map_err(|e| RemoteError::Io(e.to_string()))?,
    });

    Ok(json!({
        "apiVersion": format!("{LWS_GROUP}/{version}"),
        "kind": LWS_KIND,
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": {"app": "keras-remote-pathways"},
        },
        "spec": {
            "replicas": 1,
            "leaderWorkerTemplate": {
                "size": size,
                "restartPolicy": "RecreateGroupOnPodRestart",
                "leaderTemplate": pod_template.clone(),
                "workerTemplate": pod_template,
            },
        },
    }))
}

fn lws_api(client: &kube::Client, namespace: &str, version: &str) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk(LWS_GROUP, version, LWS_KIND);
    let resource = ApiResource::from_gvk_with_plural(&gvk, LWS_PLURAL);
    Api::namespaced_with(client.clone(), namespace, &resource)
}

/// Exit code of the first container, from either the current or the last
/// terminated state.
fn first_container_exit_code(pod: &Pod) -> Option<(i32, bool)> {
    let container_status = pod.status.as_ref()?.container_statuses.as_ref()?.first()?;

    if let Some(terminated) = container_status.state.as_ref().and_then(|s| s.terminated.as_ref()) {
        return Some((terminated.exit_code, false));
    }

    if let Some(terminated) = container_status.last_state.as_ref().and_then(|s| s.terminated.as_ref()) {
        return Some((terminated.exit_code, true));
    }

    None
}

impl JobBackend for LeaderWorkerBackend {
    fn submit_job(&self, ctx: &JobContext) -> Result<JobHandle, RemoteError> {
        let client = kube_client()?;
        if let Some(cluster) = &self.cluster {
            debug!("Submitting to cluster {}", cluster);
        }

        let version = discover_lws_version(&client);
        let manifest = build_lws_manifest(ctx, &self.namespace, &version)?;
        let name = job_name(&ctx.job_id);

        let object: DynamicObject =
            serde_json::from_value(manifest).map_err(|e| RemoteError::Submission(e.to_string()))?;

        let api = lws_api(&client, &self.namespace, &version);
        block_on(api.create(&PostParams::default(), &object)).map_err(|e| match &e {
            kube::Error::Api(api_error) if api_error.code == 404 => RemoteError::Submission(
                "LeaderWorkerSet CRD not found. Please ensure it is installed on the cluster, following the official LWS installation guide.".to_string(),
            ),
            kube::Error::Api(api_error) => RemoteError::Submission(format!(
                "Kubernetes API error: {} - {}: {}",
                api_error.code, api_error.reason, api_error.message
            )),
            _ => RemoteError::Submission(e.to_string()),
        })?;

        info!("Submitted Pathways job (LWS): {}", name);
        info!("View job with: kubectl get {} {} -n {}", LWS_PLURAL, name, self.namespace);

        Ok(JobHandle::new(name))
    }

    /// Completion is driven off the leader pod: the custom resource has no
    /// job-style status conditions to poll.
    fn wait_for_job(&self, handle: &JobHandle, ctx: &JobContext) -> Result<(), RemoteError> {
        let client = kube_client()?;
        let pods: Api<Pod> = Api::namespaced(client.clone(), &self.namespace);

        let leader_name = leader_pod_name(&ctx.job_id);
        let started_at = Instant::now();
        let mut leader_seen = false;

        loop {
            if started_at.elapsed() > JOB_WAIT_TIMEOUT {
                return Err(RemoteError::Job(format!(
                    "Pathways job {} timed out after {}s",
                    handle.name,
                    JOB_WAIT_TIMEOUT.as_secs()
                )));
            }

            let pod = match block_on(pods.get(&leader_name)) {
                Ok(pod) => {
                    if !leader_seen {
                        info!("Found pod: {}", leader_name);
                        log_streaming::start(client.clone(), leader_name.clone(), self.namespace.clone());
                        leader_seen = true;
                    }
                    Some(pod)
                }
                // Pod might not be created yet.
                Err(e) if is_kube_not_found(&e) => None,
                Err(e) => {
                    return Err(RemoteError::Job(format!("Failed to read leader pod status: {e}")));
                }
            };

            if let Some(pod) = &pod {
                match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                    Some("Succeeded") => {
                        info!("[REMOTE] Job {} completed successfully", handle.name);
                        return Ok(());
                    }
                    Some("Failed") => {
                        tail_pod_logs(&client, &self.namespace, &handle.name);
                        return Err(RemoteError::Job(format!("Pathways job {} failed", handle.name)));
                    }
                    Some("Pending") => {
                        check_pod_scheduling(std::slice::from_ref(pod))?;
                        debug!("Pod is Pending...");
                    }
                    _ => {}
                }

                // The pod can report Running while the first container has
                // already exited cleanly.
                if let Some((exit_code, restarted)) = first_container_exit_code(pod) {
                    if exit_code == 0 {
                        let suffix = if restarted { " (restarted)" } else { "" };
                        info!("[REMOTE] Job {} completed successfully{}", handle.name, suffix);
                        return Ok(());
                    }

                    tail_pod_logs(&client, &self.namespace, &handle.name);
                    return Err(RemoteError::Job(format!(
                        "Pathways job {} failed with exit code {}",
                        handle.name, exit_code
                    )));
                }
            }

            std::thread::sleep(JOB_POLL_INTERVAL);
        }
    }

    fn cleanup_job(&self, handle: &JobHandle, _ctx: &JobContext) -> Result<(), RemoteError> {
        let client = kube_client()?;
        let version = discover_lws_version(&client);
        let api = lws_api(&client, &self.namespace, &version);

        match block_on(api.delete(&handle.name, &DeleteParams::default())) {
            Ok(_) => {
                info!("Deleted LeaderWorkerSet: {}", handle.name);
                Ok(())
            }
            Err(e) if is_kube_not_found(&e) => Ok(()),
            Err(e) => Err(RemoteError::Job(format!(
                "Failed to delete LeaderWorkerSet {}: {e}",
                handle.name
            ))),
        }
    }
}
