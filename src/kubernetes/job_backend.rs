use crate::errors::RemoteError;
use crate::execution::JobContext;
use crate::kubernetes::{
    APP_LABEL, JOB_POLL_INTERVAL, JOB_WAIT_TIMEOUT, JobBackend, JobHandle, build_pod_spec, check_pod_scheduling,
    is_kube_not_found, kube_client, list_job_pods, log_streaming, tail_pod_logs,
};
use crate::runtime::block_on;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::Api;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

/// One pod on a single accelerator node: CPU, GPU, or a single-host TPU
/// slice.
pub struct SinglePodBackend {
    cluster: Option<String>,
    namespace: String,
}

impl SinglePodBackend {
    pub fn new(cluster: Option<String>, namespace: String) -> Self {
        SinglePodBackend { cluster, namespace }
    }
}

fn workload_labels(ctx: &JobContext) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_LABEL.to_string()),
        ("job-id".to_string(), ctx.job_id.clone()),
    ])
}

/// The Job resource for a single-pod run. No retries, cluster-side garbage
/// collection after ten minutes.
pub fn build_job_manifest(ctx: &JobContext, namespace: &str) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(ctx.display_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(workload_labels(ctx)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(600),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(workload_labels(ctx)),
                    ..Default::default()
                }),
                spec: Some(build_pod_spec(ctx, vec![])),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn map_submission_error(error: kube::Error, job_name: &str, namespace: &str) -> RemoteError {
    match &error {
        kube::Error::Api(api_error) => match api_error.code {
            403 => RemoteError::Submission(format!(
                "Permission denied creating K8s Job. Ensure your kubeconfig has 'create' permission for Jobs in namespace '{namespace}'. Run: kubectl auth can-i create jobs -n {namespace}"
            )),
            404 => RemoteError::Submission(format!(
                "Namespace '{namespace}' not found. Create it with: kubectl create namespace {namespace}"
            )),
            409 => RemoteError::Submission(format!(
                "Job '{job_name}' already exists. Clean up with: kubectl delete job {job_name} -n {namespace}"
            )),
            code => RemoteError::Submission(format!(
                "Kubernetes API error: {code} - {reason}: {message}",
                reason = api_error.reason,
                message = api_error.message
            )),
        },
        _ => RemoteError::Submission(error.to_string()),
    }
}

impl JobBackend for SinglePodBackend {
    fn submit_job(&self, ctx: &JobContext) -> Result<JobHandle, RemoteError> {
        let client = kube_client()?;
        if let Some(cluster) = &self.cluster {
            debug!("Submitting to cluster {}", cluster);
        }

        let job = build_job_manifest(ctx, &self.namespace);
        let job_name = ctx.display_name.clone();

        let api: Api<Job> = Api::namespaced(client, &self.namespace);
        block_on(api.create(&PostParams::default(), &job))
            .map_err(|e| map_submission_error(e, &job_name, &self.namespace))?;

        info!("Submitted K8s job: {}", job_name);
        info!("View job with: kubectl get job {} -n {}", job_name, self.namespace);
        info!("View logs with: kubectl logs -l job-name={} -n {}", job_name, self.namespace);

        Ok(JobHandle::new(job_name))
    }

    fn wait_for_job(&self, handle: &JobHandle, _ctx: &JobContext) -> Result<(), RemoteError> {
        let client = kube_client()?;
        let api: Api<Job> = Api::namespaced(client.clone(), &self.namespace);

        let started_at = Instant::now();
        let mut streamed_pods: HashSet<String> = HashSet::new();
        let mut logged_running = false;

        loop {
            if started_at.elapsed() > JOB_WAIT_TIMEOUT {
                return Err(RemoteError::Job(format!(
                    "GKE job {} timed out after {}s",
                    handle.name,
                    JOB_WAIT_TIMEOUT.as_secs()
                )));
            }

            let job = block_on(api.get_status(&handle.name))
                .map_err(|e| RemoteError::Job(format!("Failed to read job status: {e}")))?;

            if let Some(status) = &job.status {
                if status.succeeded.unwrap_or(0) >= 1 {
                    println!("[REMOTE] Job {} completed successfully", handle.name);
                    return Ok(());
                }

                if status.failed.unwrap_or(0) >= 1 {
                    tail_pod_logs(&client, &self.namespace, &handle.name);
                    return Err(RemoteError::Job(format!("GKE job {} failed", handle.name)));
                }
            }

            if let Ok(pods) = list_job_pods(&client, &self.namespace, &handle.name) {
                check_pod_scheduling(&pods)?;

                for pod in &pods {
                    if let Some(pod_name) = &pod.metadata.name {
                        if streamed_pods.insert(pod_name.clone()) {
                            log_streaming::start(client.clone(), pod_name.clone(), self.namespace.clone());
                        }
                    }
                }
            }

            if !logged_running {
                info!("Job {} running...", handle.name);
                logged_running = true;
            }

            std::thread::sleep(JOB_POLL_INTERVAL);
        }
    }

    fn cleanup_job(&self, handle: &JobHandle, _ctx: &JobContext) -> Result<(), RemoteError> {
        let client = kube_client()?;
        let api: Api<Job> = Api::namespaced(client, &self.namespace);

        // Foreground propagation so the pods are reaped with the job.
        match block_on(api.delete(&handle.name, &DeleteParams::foreground())) {
            Ok(_) => {
                info!("Deleted K8s job: {}", handle.name);
                Ok(())
            }
            Err(e) if is_kube_not_found(&e) => Ok(()),
            Err(e) => Err(RemoteError::Job(format!("Failed to delete job {}: {e}", handle.name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{JobContext, RemoteOptions};
    use crate::packager::{FunctionRef, Payload};

    fn test_ctx(accelerator: &str) -> JobContext {
        let options = RemoteOptions {
            accelerator: accelerator.to_string(),
            project: Some("my-project".to_string()),
            working_dir: Some(std::path::PathBuf::from(".")),
            ..Default::default()
        };
        let payload = Payload {
            func: FunctionRef::new("train"),
            args: vec![],
            kwargs: Default::default(),
            env_vars: Default::default(),
        };

        let mut ctx = JobContext::from_options("train", payload, &options).expect("context should build");
        ctx.image_uri = Some("us-docker.pkg.dev/my-project/keras-remote/base:test".to_string());
        ctx
    }

    fn job_env(job: &Job) -> Vec<(String, Option<String>)> {
        job.spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }

    #[test]
    fn test_job_manifest_failure_policy() {
        let ctx = test_ctx("cpu");
        let job = build_job_manifest(&ctx, "default");

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(600));
        assert_eq!(
            spec.template.spec.as_ref().unwrap().restart_policy.as_deref(),
            Some("Never")
        );
    }

    #[test]
    fn test_job_manifest_labels() {
        let ctx = test_ctx("cpu");
        let job = build_job_manifest(&ctx, "default");

        let expected = BTreeMap::from([
            ("app".to_string(), "keras-remote".to_string()),
            ("job-id".to_string(), ctx.job_id.clone()),
        ]);
        assert_eq!(job.metadata.labels.as_ref(), Some(&expected));
        assert_eq!(
            job.spec.as_ref().unwrap().template.metadata.as_ref().unwrap().labels.as_ref(),
            Some(&expected)
        );
        assert_eq!(job.metadata.name.as_ref(), Some(&ctx.display_name));
    }

    #[test]
    fn test_job_manifest_runner_contract() {
        let ctx = test_ctx("l4");
        let job = build_job_manifest(&ctx, "default");

        let container = &job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, "keras-remote-worker");
        assert_eq!(container.command.as_ref().unwrap(), &vec!["/app/remote_runner".to_string()]);
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec![ctx.context_uri(), ctx.payload_uri(), ctx.result_uri()]
        );

        let env = job_env(&job);
        assert!(env.contains(&("KERAS_BACKEND".to_string(), Some("jax".to_string()))));
        assert!(env.contains(&("JAX_PLATFORMS".to_string(), Some("gpu".to_string()))));
        assert!(env.contains(&("JOB_ID".to_string(), Some(ctx.job_id.clone()))));
        assert!(env.contains(&("GCS_BUCKET".to_string(), Some(ctx.bucket_name.clone()))));
    }

    #[test]
    fn test_job_manifest_cpu_has_no_accelerator_constraints() {
        let ctx = test_ctx("cpu");
        let job = build_job_manifest(&ctx, "default");

        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert!(pod_spec.node_selector.is_none());
        assert!(pod_spec.tolerations.is_none());

        let resources = pod_spec.containers[0].resources.as_ref().unwrap();
        assert!(resources.limits.is_none());
        assert!(resources.requests.is_none());
    }

    #[test]
    fn test_job_manifest_gpu_constraints() {
        let ctx = test_ctx("a100x4");
        let job = build_job_manifest(&ctx, "default");

        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(
            pod_spec.node_selector.as_ref().unwrap().get("cloud.google.com/gke-accelerator"),
            Some(&"nvidia-tesla-a100".to_string())
        );

        let limits = pod_spec.containers[0].resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get("nvidia.com/gpu").unwrap().0, "4");

        let tolerations = pod_spec.tolerations.as_ref().unwrap();
        assert_eq!(tolerations[0].key.as_deref(), Some("nvidia.com/gpu"));
        assert_eq!(tolerations[0].operator.as_deref(), Some("Exists"));
        assert_eq!(tolerations[0].effect.as_deref(), Some("NoSchedule"));
    }

    #[test]
    fn test_map_submission_error_hints() {
        let api_error = |code: u16| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "Forbidden".to_string(),
                code,
            })
        };

        let forbidden = map_submission_error(api_error(403), "keras-remote-x", "default");
        assert!(forbidden.to_string().contains("kubectl auth can-i create jobs"));

        let missing_namespace = map_submission_error(api_error(404), "keras-remote-x", "default");
        assert!(missing_namespace.to_string().contains("kubectl create namespace"));

        let conflict = map_submission_error(api_error(409), "keras-remote-x", "default");
        assert!(conflict.to_string().contains("kubectl delete job keras-remote-x"));
    }
}
