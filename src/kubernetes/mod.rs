pub mod job_backend;
pub mod leader_worker;
pub mod log_streaming;

use crate::accelerator::Accelerator;
use crate::errors::RemoteError;
use crate::execution::JobContext;
use crate::runtime::block_on;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::Api;
use kube::api::ListParams;
use std::collections::BTreeMap;
use std::time::Duration;

pub const APP_LABEL: &str = "keras-remote";
pub const WORKER_CONTAINER_NAME: &str = "keras-remote-worker";
pub const RUNNER_COMMAND: &str = "/app/remote_runner";

/// Fixed cadence and overall bound for workload status polling.
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const JOB_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Opaque backend-specific value returned by `submit_job`, sufficient for
/// `wait_for_job` and `cleanup_job`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobHandle {
    pub name: String,
}

impl JobHandle {
    pub fn new(name: impl Into<String>) -> Self {
        JobHandle { name: name.into() }
    }
}

/// A workload backend: submits, waits until terminal, cleans up. Cleanup is
/// best-effort and must swallow "not found".
pub trait JobBackend {
    fn submit_job(&self, ctx: &JobContext) -> Result<JobHandle, RemoteError>;
    fn wait_for_job(&self, handle: &JobHandle, ctx: &JobContext) -> Result<(), RemoteError>;
    fn cleanup_job(&self, handle: &JobHandle, ctx: &JobContext) -> Result<(), RemoteError>;
}

/// Connect to the cluster: in-cluster configuration first, kubeconfig
/// fallback (KUBECONFIG or ~/.kube/config).
pub fn kube_client() -> Result<kube::Client, RemoteError> {
    block_on(async {
        match kube::Config::incluster() {
            Ok(config) => kube::Client::try_from(config).map_err(|e| e.to_string()),
            Err(_) => kube::Client::try_default().await.map_err(|e| e.to_string()),
        }
    })
    .map_err(|e| {
        RemoteError::Credential(format!(
            "Failed to load Kubernetes configuration. Ensure you have run 'gcloud container clusters get-credentials <cluster-name>' or have a valid kubeconfig. Error: {e}"
        ))
    })
}

/// Scheduling knobs derived from the accelerator descriptor, shared by both
/// workload shapes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodScheduling {
    pub node_selector: BTreeMap<String, String>,
    pub resources: BTreeMap<String, Quantity>,
    pub tolerations: Vec<Toleration>,
}

pub fn accelerator_pod_scheduling(accelerator: &Accelerator) -> PodScheduling {
    match accelerator {
        Accelerator::Cpu => PodScheduling::default(),
        Accelerator::Gpu(gpu) => PodScheduling {
            node_selector: BTreeMap::from([(
                "cloud.google.com/gke-accelerator".to_string(),
                gpu.gke_label.to_string(),
            )]),
            resources: BTreeMap::from([("nvidia.com/gpu".to_string(), Quantity(gpu.count.to_string()))]),
            tolerations: vec![Toleration {
                key: Some("nvidia.com/gpu".to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }],
        },
        Accelerator::Tpu(tpu) => PodScheduling {
            node_selector: BTreeMap::from([
                (
                    "cloud.google.com/gke-tpu-accelerator".to_string(),
                    tpu.gke_accelerator.to_string(),
                ),
                ("cloud.google.com/gke-tpu-topology".to_string(), tpu.topology.to_string()),
            ]),
            resources: BTreeMap::from([("google.com/tpu".to_string(), Quantity(tpu.chips.to_string()))]),
            tolerations: vec![Toleration {
                key: Some("google.com/tpu".to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }],
        },
    }
}

/// Environment injected into every remote pod.
pub fn runner_env_vars(ctx: &JobContext) -> Vec<EnvVar> {
    let env_var = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    };

    vec![
        env_var("KERAS_BACKEND", "jax".to_string()),
        env_var("JAX_PLATFORMS", ctx.accelerator.category().jax_platform().to_string()),
        env_var("JOB_ID", ctx.job_id.clone()),
        env_var("GCS_BUCKET", ctx.bucket_name.clone()),
    ]
}

/// Positional object-store URIs handed to the runner: context, payload,
/// result, in that order.
pub fn runner_args(ctx: &JobContext) -> Vec<String> {
    vec![ctx.context_uri(), ctx.payload_uri(), ctx.result_uri()]
}

/// The per-pod contract shared by both backends: runner entrypoint, staged
/// artifact URIs, runner environment, accelerator scheduling.
pub fn build_pod_spec(ctx: &JobContext, extra_env: Vec<EnvVar>) -> PodSpec {
    let scheduling = accelerator_pod_scheduling(&ctx.accelerator);

    let mut env = runner_env_vars(ctx);
    env.extend(extra_env);

    let container = Container {
        name: WORKER_CONTAINER_NAME.to_string(),
        image: ctx.image_uri.clone(),
        command: Some(vec![RUNNER_COMMAND.to_string()]),
        args: Some(runner_args(ctx)),
        env: Some(env),
        resources: Some(ResourceRequirements {
            limits: (!scheduling.resources.is_empty()).then(|| scheduling.resources.clone()),
            requests: (!scheduling.resources.is_empty()).then(|| scheduling.resources.clone()),
            ..Default::default()
        }),
        ..Default::default()
    };

    PodSpec {
        containers: vec![container],
        node_selector: (!scheduling.node_selector.is_empty()).then_some(scheduling.node_selector),
        tolerations: (!scheduling.tolerations.is_empty()).then_some(scheduling.tolerations),
        restart_policy: Some("Never".to_string()),
        ..Default::default()
    }
}

/// Translate well-known pending-pod conditions into actionable errors.
pub fn check_pod_scheduling(pods: &[Pod]) -> Result<(), RemoteError> {
    for pod in pods {
        let status = match &pod.status {
            Some(status) => status,
            None => continue,
        };

        if status.phase.as_deref() != Some("Pending") {
            continue;
        }

        for condition in status.conditions.iter().flatten() {
            if condition.type_ != "PodScheduled" || condition.status != "False" {
                continue;
            }

            let message = condition.message.as_deref().unwrap_or("");
            if message.contains("Insufficient nvidia.com/gpu") {
                return Err(RemoteError::Scheduling(
                    "No GPU nodes available. Ensure your GKE cluster has a node pool with the required GPU type and available capacity.".to_string(),
                ));
            }
            if message.contains("didn't match Pod's node affinity/selector")
                || message.to_lowercase().contains("node selector")
            {
                return Err(RemoteError::Scheduling(
                    "No nodes match the accelerator selector. Check that your node pool has the correct accelerator type label.".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// List the pods belonging to a workload by its `job-name` label.
pub fn list_job_pods(client: &kube::Client, namespace: &str, job_name: &str) -> Result<Vec<Pod>, kube::Error> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(&format!("job-name={job_name}"));

    block_on(api.list(&params)).map(|pods| pods.items)
}

/// Dump the last lines of every pod of a failed workload. Failures here are
/// swallowed: we are already on an error path.
pub fn tail_pod_logs(client: &kube::Client, namespace: &str, job_name: &str) {
    let pods = match list_job_pods(client, namespace, job_name) {
        Ok(pods) => pods,
        Err(_) => return,
    };

    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    for pod in pods {
        let pod_name = match &pod.metadata.name {
            Some(name) => name.clone(),
            None => continue,
        };

        let log_params = kube::api::LogParams {
            tail_lines: Some(100),
            ..Default::default()
        };
        if let Ok(logs) = block_on(api.logs(&pod_name, &log_params)) {
            println!("[REMOTE] Pod {pod_name} logs:\n{logs}");
        }
    }
}

/// 404 from the API server, as returned for missing objects.
pub fn is_kube_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(api_error) if api_error.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::parse_accelerator;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::api::ObjectMeta;

    fn pending_pod(message: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("keras-remote-job-12345678-abcde".to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    message: Some(message.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_cpu_scheduling_is_empty() {
        let scheduling = accelerator_pod_scheduling(&parse_accelerator("cpu").unwrap());

        assert!(scheduling.node_selector.is_empty());
        assert!(scheduling.resources.is_empty());
        assert!(scheduling.tolerations.is_empty());
    }

    #[test]
    fn test_gpu_scheduling() {
        let scheduling = accelerator_pod_scheduling(&parse_accelerator("a100x4").unwrap());

        assert_eq!(
            scheduling.node_selector.get("cloud.google.com/gke-accelerator"),
            Some(&"nvidia-tesla-a100".to_string())
        );
        assert_eq!(scheduling.resources.get("nvidia.com/gpu"), Some(&Quantity("4".to_string())));
        assert_eq!(scheduling.tolerations.len(), 1);
        assert_eq!(scheduling.tolerations[0].key.as_deref(), Some("nvidia.com/gpu"));
    }

    #[test]
    fn test_tpu_scheduling() {
        let scheduling = accelerator_pod_scheduling(&parse_accelerator("v5litepod-4").unwrap());

        assert_eq!(
            scheduling.node_selector.get("cloud.google.com/gke-tpu-accelerator"),
            Some(&"tpu-v5-lite-podslice".to_string())
        );
        assert_eq!(
            scheduling.node_selector.get("cloud.google.com/gke-tpu-topology"),
            Some(&"2x2".to_string())
        );
        assert_eq!(scheduling.resources.get("google.com/tpu"), Some(&Quantity("4".to_string())));
        assert_eq!(scheduling.tolerations[0].key.as_deref(), Some("google.com/tpu"));
    }

    #[test]
    fn test_check_pod_scheduling_translates_gpu_shortage() {
        let pods = vec![pending_pod("0/3 nodes are available: 3 Insufficient nvidia.com/gpu.")];
        let error = check_pod_scheduling(&pods).unwrap_err();

        assert!(matches!(error, RemoteError::Scheduling(_)));
        assert!(error.to_string().contains("No GPU nodes available"));
    }

    #[test]
    fn test_check_pod_scheduling_translates_selector_mismatch() {
        let pods = vec![pending_pod("0/3 nodes are available: 3 node(s) didn't match Pod's node affinity/selector.")];
        let error = check_pod_scheduling(&pods).unwrap_err();

        assert!(error.to_string().contains("No nodes match the accelerator selector"));
    }

    #[test]
    fn test_check_pod_scheduling_ignores_running_pods() {
        let mut pod = pending_pod("Insufficient nvidia.com/gpu");
        pod.status.as_mut().unwrap().phase = Some("Running".to_string());

        assert!(check_pod_scheduling(&[pod]).is_ok());
    }
}
