use crate::accelerator::{Accelerator, parse_accelerator};
use crate::build_platform::cloud_build::CloudBuildService;
use crate::build_platform::{DEFAULT_BASE_IMAGE, ImageBuilder};
use crate::constants;
use crate::container_registry::ArtifactRegistryService;
use crate::errors::RemoteError;
use crate::kubernetes::job_backend::SinglePodBackend;
use crate::kubernetes::leader_worker::LeaderWorkerBackend;
use crate::kubernetes::JobBackend;
use crate::object_storage::{
    CONTEXT_OBJECT, ObjectStorageService, ObjectStorageServiceError, PAYLOAD_OBJECT, RESULT_OBJECT, gs_uri,
    job_object_key,
};
use crate::packager::{self, FunctionRef, Payload};
use scopeguard::guard;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Kubernetes object names are DNS labels.
const MAX_DISPLAY_NAME_LEN: usize = 63;

/// Which workload shape to submit. `Auto` picks leader/worker exactly for
/// multi-host TPU slices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    SinglePod,
    LeaderWorker,
    Auto,
}

/// Options of the decorator surface. One instance per decorated function.
#[derive(Clone, Debug)]
pub struct RemoteOptions {
    /// TPU/GPU type (e.g. "v3-8", "v5litepod-4", "l4", "a100x4") or "cpu".
    pub accelerator: String,
    /// Custom container image URI; skips the image build when set.
    pub container_image: Option<String>,
    /// GCP zone (default: KERAS_REMOTE_ZONE or "us-central1-a").
    pub zone: Option<String>,
    /// GCP project (default: KERAS_REMOTE_PROJECT).
    pub project: Option<String>,
    /// GKE cluster name (default: KERAS_REMOTE_CLUSTER).
    pub cluster: Option<String>,
    /// Kubernetes namespace (default: KERAS_REMOTE_NAMESPACE or "default").
    pub namespace: String,
    pub backend: BackendKind,
    /// Environment variable names, or prefixes ending in `*`, to propagate
    /// to the remote process.
    pub capture_env_vars: Vec<String>,
    /// Source tree shipped to the remote side; current directory when unset.
    pub working_dir: Option<PathBuf>,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        RemoteOptions {
            accelerator: "v3-8".to_string(),
            container_image: None,
            zone: None,
            project: None,
            cluster: None,
            namespace: String::new(),
            backend: BackendKind::Auto,
            capture_env_vars: vec![],
            working_dir: None,
        }
    }
}

/// All state of one remote call. Created per call, immutable after
/// construction except for the artifact paths filled in during packaging.
pub struct JobContext {
    pub payload: Payload,
    pub accelerator_name: String,
    pub accelerator: Accelerator,
    pub container_image: Option<String>,
    pub project: String,
    pub zone: String,
    pub region: String,
    pub bucket_name: String,
    pub job_id: String,
    pub display_name: String,
    pub working_dir: PathBuf,

    // Set during the packaging phase.
    pub payload_path: Option<PathBuf>,
    pub context_path: Option<PathBuf>,
    pub requirements_path: Option<PathBuf>,
    pub image_uri: Option<String>,
}

impl JobContext {
    pub fn from_options(func_name: &str, payload: Payload, options: &RemoteOptions) -> Result<JobContext, RemoteError> {
        let accelerator = parse_accelerator(&options.accelerator)?;

        let zone = options.zone.clone().unwrap_or_else(constants::default_zone);
        let project = constants::resolve_project(options.project.as_deref()).ok_or_else(|| {
            RemoteError::Config(
                "project must be specified or set KERAS_REMOTE_PROJECT environment variable".to_string(),
            )
        })?;

        let working_dir = match &options.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(|e| RemoteError::Io(e.to_string()))?,
        };

        let job_id = new_job_id();
        let display_name = display_name(func_name, &job_id);

        Ok(JobContext {
            payload,
            accelerator_name: options.accelerator.trim().to_lowercase(),
            accelerator,
            container_image: options.container_image.clone(),
            region: constants::zone_to_region(&zone),
            bucket_name: format!("{project}-keras-remote-jobs"),
            project,
            zone,
            job_id,
            display_name,
            working_dir,
            payload_path: None,
            context_path: None,
            requirements_path: None,
            image_uri: None,
        })
    }

    pub fn context_uri(&self) -> String {
        gs_uri(&self.bucket_name, &job_object_key(&self.job_id, CONTEXT_OBJECT))
    }

    pub fn payload_uri(&self) -> String {
        gs_uri(&self.bucket_name, &job_object_key(&self.job_id, PAYLOAD_OBJECT))
    }

    pub fn result_uri(&self) -> String {
        gs_uri(&self.bucket_name, &job_object_key(&self.job_id, RESULT_OBJECT))
    }
}

/// `job-` + 8 hex chars, unique across a bucket with overwhelming probability.
fn new_job_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("job-{}", &uuid[..8])
}

/// `keras-remote-{func}-{job_id}`, coerced into a valid DNS label: the
/// function name is lowercased, non-alphanumerics collapse to dashes and the
/// name is truncated from the middle so the unique job id survives.
fn display_name(func_name: &str, job_id: &str) -> String {
    let sanitized: String = func_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let sanitized = sanitized.trim_matches('-');

    let fixed_len = "keras-remote-".len() + 1 + job_id.len();
    let max_func_len = MAX_DISPLAY_NAME_LEN.saturating_sub(fixed_len);
    let truncated = &sanitized[..sanitized.len().min(max_func_len)];
    let truncated = truncated.trim_matches('-');

    if truncated.is_empty() {
        format!("keras-remote-{job_id}")
    } else {
        format!("keras-remote-{truncated}-{job_id}")
    }
}

/// Resolve `capture_env_vars` patterns against the current environment.
/// A trailing `*` matches by prefix, anything else must match exactly.
pub fn capture_env_vars(patterns: &[String]) -> BTreeMap<String, String> {
    let mut captured = BTreeMap::new();

    for pattern in patterns {
        match pattern.strip_suffix('*') {
            Some(prefix) => {
                captured.extend(std::env::vars().filter(|(name, _)| name.starts_with(prefix)));
            }
            None => {
                if let Ok(value) = std::env::var(pattern) {
                    captured.insert(pattern.clone(), value);
                }
            }
        }
    }

    captured
}

/// Search up the directory tree for a requirements manifest.
pub fn find_requirements(start_dir: &Path) -> Option<PathBuf> {
    let mut search_dir = start_dir;

    loop {
        let candidate = search_dir.join("requirements.txt");
        if candidate.exists() {
            return Some(candidate);
        }

        search_dir = search_dir.parent()?;
    }
}

fn resolved_namespace(options: &RemoteOptions) -> String {
    if !options.namespace.is_empty() {
        return options.namespace.clone();
    }

    std::env::var(constants::NAMESPACE_ENV_VAR).unwrap_or_else(|_| constants::DEFAULT_NAMESPACE.to_string())
}

fn resolved_cluster(options: &RemoteOptions) -> Option<String> {
    options.cluster.clone().or_else(|| std::env::var(constants::CLUSTER_ENV_VAR).ok())
}

/// Apply the backend selection rule and validate it against the accelerator.
pub fn select_backend(kind: BackendKind, accelerator: &Accelerator) -> Result<BackendKind, RemoteError> {
    match kind {
        BackendKind::Auto => {
            if accelerator.is_multi_host() {
                Ok(BackendKind::LeaderWorker)
            } else {
                Ok(BackendKind::SinglePod)
            }
        }
        BackendKind::SinglePod => {
            if accelerator.is_multi_host() {
                return Err(RemoteError::Config(
                    "multi-host TPU slices need the leader-worker backend; use backend=auto or backend=leader-worker"
                        .to_string(),
                ));
            }
            Ok(BackendKind::SinglePod)
        }
        BackendKind::LeaderWorker => {
            if !matches!(accelerator, Accelerator::Tpu(_)) {
                return Err(RemoteError::Config(
                    "the leader-worker backend requires a TPU accelerator".to_string(),
                ));
            }
            Ok(BackendKind::LeaderWorker)
        }
    }
}

fn build_backend(options: &RemoteOptions, accelerator: &Accelerator) -> Result<Box<dyn JobBackend>, RemoteError> {
    let namespace = resolved_namespace(options);
    let cluster = resolved_cluster(options);

    match select_backend(options.backend, accelerator)? {
        BackendKind::SinglePod => Ok(Box::new(SinglePodBackend::new(cluster, namespace))),
        BackendKind::LeaderWorker => Ok(Box::new(LeaderWorkerBackend::new(cluster, namespace))),
        BackendKind::Auto => unreachable!("select_backend always resolves Auto"),
    }
}

/// Cloud services the orchestrator drives. Built once per call.
pub struct ExecutionServices {
    pub storage: Arc<ObjectStorageService>,
    pub builder: ImageBuilder,
}

impl ExecutionServices {
    pub fn new() -> Result<Self, RemoteError> {
        let storage = Arc::new(
            ObjectStorageService::new().map_err(|e| RemoteError::Credential(e.to_string()))?,
        );
        let registry = ArtifactRegistryService::new().map_err(|e| RemoteError::Credential(e.to_string()))?;
        let cloud_build = CloudBuildService::new().map_err(|e| RemoteError::Credential(e.to_string()))?;

        Ok(ExecutionServices {
            builder: ImageBuilder::new(registry, storage.clone(), cloud_build),
            storage,
        })
    }
}

/// The decorator surface: wraps a registered function with remote-execution
/// options. Calling it runs the whole pipeline and behaves like an
/// in-process call.
pub struct RemoteFunction {
    name: String,
    options: RemoteOptions,
}

impl RemoteFunction {
    pub fn new(name: impl Into<String>, options: RemoteOptions) -> Self {
        RemoteFunction {
            name: name.into(),
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value, RemoteError> {
        let env_vars = capture_env_vars(&self.options.capture_env_vars);
        let payload = Payload {
            func: FunctionRef::new(&self.name),
            args,
            kwargs,
            env_vars,
        };

        let mut ctx = JobContext::from_options(&self.name, payload, &self.options)?;
        let backend = build_backend(&self.options, &ctx.accelerator)?;
        let services = ExecutionServices::new()?;

        execute_remote(&mut ctx, backend.as_ref(), &services)
    }
}

/// Execute a function remotely: package, build, upload, submit, wait,
/// download, finalize. The scoped working directory is removed on every exit
/// path; backend cleanup runs whether the wait succeeds or fails.
pub fn execute_remote(
    ctx: &mut JobContext,
    backend: &dyn JobBackend,
    services: &ExecutionServices,
) -> Result<Value, RemoteError> {
    let workspace = tempfile::tempdir().map_err(|e| RemoteError::Io(e.to_string()))?;

    // Phase 1: package payload and source tree.
    info!("Packaging function and context (job: {})...", ctx.job_id);
    let payload_path = workspace.path().join("payload.json");
    packager::save_payload(&ctx.payload, &payload_path)?;

    let context_path = workspace.path().join("context.tar.gz");
    packager::archive_working_dir(&ctx.working_dir, &context_path)?;

    ctx.requirements_path = find_requirements(&ctx.working_dir);
    match &ctx.requirements_path {
        Some(path) => info!("Found requirements.txt: {}", path.display()),
        None => info!("No requirements.txt found"),
    }
    ctx.payload_path = Some(payload_path.clone());
    ctx.context_path = Some(context_path.clone());

    // Phase 2: build or reuse the container image.
    match &ctx.container_image {
        Some(image) => {
            info!("Using custom container: {}", image);
            ctx.image_uri = Some(image.clone());
        }
        None => {
            info!("Building container image...");
            let image_uri = services.builder.get_or_build(
                DEFAULT_BASE_IMAGE,
                ctx.requirements_path.as_deref(),
                &ctx.accelerator_name,
                ctx.accelerator.category(),
                &ctx.project,
                &ctx.zone,
            )?;
            ctx.image_uri = Some(image_uri);
        }
    }

    // Phase 3: stage artifacts.
    info!("Uploading artifacts to Cloud Storage (job: {})...", ctx.job_id);
    services
        .storage
        .upload_artifacts(&ctx.bucket_name, &ctx.job_id, &payload_path, &context_path, &ctx.project)?;

    // Phase 4: submit.
    let handle = backend.submit_job(ctx)?;

    // Phase 5: wait, with backend cleanup on both success and failure.
    let job_result = {
        let ctx: &JobContext = ctx;
        let cleanup = guard((), |_| {
            if let Err(e) = backend.cleanup_job(&handle, ctx) {
                warn!("Failed to clean up workload {}: {}", handle.name, e);
            }
        });
        let job_result = backend.wait_for_job(&handle, ctx);
        drop(cleanup);
        job_result
    };

    // Phase 6: download the result envelope. Attempted even when the wait
    // failed: the runner may have captured a user exception and uploaded the
    // result before exiting non-zero.
    info!("Downloading result...");
    let result_path = match services.storage.download_result(&ctx.bucket_name, &ctx.job_id) {
        Ok(path) => path,
        Err(download_error) => {
            return Err(match job_result {
                // The job failed and no result was uploaded (infrastructure
                // failure): the wait error is the more precise one.
                Err(job_error) => {
                    if !matches!(download_error, ObjectStorageServiceError::ObjectNotFound { .. }) {
                        warn!("Cannot download result: {}", download_error);
                    }
                    job_error
                }
                Ok(()) => download_error.into(),
            });
        }
    };

    let envelope = match packager::load_result(&result_path) {
        Ok(envelope) => envelope,
        Err(decode_error) => {
            return Err(match job_result {
                Err(job_error) => {
                    warn!("Discarding undecodable result envelope: {}", decode_error);
                    job_error
                }
                Ok(()) => decode_error.into(),
            });
        }
    };

    // Phase 7: best-effort artifact cleanup, then return or re-raise.
    if let Err(e) = services.storage.cleanup_artifacts(&ctx.bucket_name, &ctx.job_id) {
        warn!("Failed to clean up artifacts for job {}: {}", ctx.job_id, e);
    }

    if envelope.success {
        info!("Remote execution completed successfully");
        Ok(envelope.result.unwrap_or(Value::Null))
    } else {
        let traceback = envelope.traceback.unwrap_or_default();
        error!("Remote execution failed:\n{}", traceback);
        let exception = envelope.exception.unwrap_or(crate::packager::RemoteException {
            kind: "RuntimeError".to_string(),
            message: "remote execution failed without exception details".to_string(),
        });
        Err(RemoteError::RemoteExecution {
            kind: exception.kind,
            message: exception.message,
            traceback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::JobHandle;
    use crate::packager::{RemoteException, ResultEnvelope};
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::fs::create_dir_all;
    use tempdir::TempDir;

    fn test_payload() -> Payload {
        Payload {
            func: FunctionRef::new("train"),
            args: vec![],
            kwargs: BTreeMap::new(),
            env_vars: BTreeMap::new(),
        }
    }

    fn test_options(working_dir: &Path) -> RemoteOptions {
        RemoteOptions {
            accelerator: "cpu".to_string(),
            container_image: Some("gcr.io/my-project/custom:latest".to_string()),
            project: Some("my-project".to_string()),
            working_dir: Some(working_dir.to_path_buf()),
            ..Default::default()
        }
    }

    struct StubBackend {
        wait_error: Option<RemoteError>,
        events: RefCell<Vec<&'static str>>,
    }

    impl StubBackend {
        fn new(wait_error: Option<RemoteError>) -> Self {
            StubBackend {
                wait_error,
                events: RefCell::new(vec![]),
            }
        }
    }

    impl JobBackend for StubBackend {
        fn submit_job(&self, ctx: &JobContext) -> Result<JobHandle, RemoteError> {
            self.events.borrow_mut().push("submit");
            Ok(JobHandle::new(ctx.display_name.clone()))
        }

        fn wait_for_job(&self, _handle: &JobHandle, _ctx: &JobContext) -> Result<(), RemoteError> {
            self.events.borrow_mut().push("wait");
            match &self.wait_error {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            }
        }

        fn cleanup_job(&self, _handle: &JobHandle, _ctx: &JobContext) -> Result<(), RemoteError> {
            self.events.borrow_mut().push("cleanup");
            Ok(())
        }
    }

    fn services_with_result(
        tmp_dir: &TempDir,
        envelope: Option<&ResultEnvelope>,
    ) -> ExecutionServices {
        let mut storage = ObjectStorageService::faux();
        faux::when!(storage.upload_artifacts).then_return(Ok(()));
        faux::when!(storage.cleanup_artifacts).then_return(Ok(2));

        match envelope {
            Some(envelope) => {
                let result_path = tmp_dir.path().join("result.json");
                crate::packager::save_result(envelope, &result_path).expect("error writing result fixture");
                faux::when!(storage.download_result).then_return(Ok(result_path));
            }
            None => {
                faux::when!(storage.download_result).then_return(Err(
                    ObjectStorageServiceError::ObjectNotFound {
                        bucket_name: "my-project-keras-remote-jobs".to_string(),
                        object_key: "result.json".to_string(),
                    },
                ));
            }
        }

        let storage = Arc::new(storage);
        ExecutionServices {
            builder: ImageBuilder::faux(),
            storage,
        }
    }

    #[test]
    fn test_job_id_shape_and_uniqueness() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let job_id = new_job_id();
            assert!(job_id.starts_with("job-"));
            assert_eq!(job_id.len(), 12);
            assert!(job_id[4..].chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(job_id));
        }
    }

    #[test]
    fn test_display_name_is_a_valid_dns_label() {
        let name = display_name("my_training_Function", "job-12345678");
        assert_eq!(name, "keras-remote-my-training-function-job-12345678");

        let long = display_name(&"long_function_name".repeat(10), "job-12345678");
        assert!(long.len() <= 63);
        assert!(long.ends_with("-job-12345678"));
        assert!(long.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));

        assert_eq!(display_name("___", "job-12345678"), "keras-remote-job-12345678");
    }

    #[test]
    fn test_capture_env_vars_exact_match() {
        unsafe {
            std::env::set_var("KR_TEST_EXACT_FOO", "bar");
        }

        let captured = capture_env_vars(&["KR_TEST_EXACT_FOO".to_string(), "KR_TEST_EXACT_MISSING".to_string()]);
        assert_eq!(captured.get("KR_TEST_EXACT_FOO"), Some(&"bar".to_string()));
        assert!(!captured.contains_key("KR_TEST_EXACT_MISSING"));
    }

    #[test]
    fn test_capture_env_vars_wildcard() {
        unsafe {
            std::env::set_var("KR_TEST_GLOB_A", "1");
            std::env::set_var("KR_TEST_GLOB_B", "2");
            std::env::set_var("KR_TEST_OTHER", "3");
        }

        let captured = capture_env_vars(&["KR_TEST_GLOB_*".to_string()]);
        let keys: Vec<&String> = captured.keys().collect();
        assert_eq!(keys, vec!["KR_TEST_GLOB_A", "KR_TEST_GLOB_B"]);
    }

    #[test]
    fn test_find_requirements_walks_up() {
        let tmp_dir = TempDir::new("execution").expect("error creating temporary dir");
        let nested = tmp_dir.path().join("a/b/c");
        create_dir_all(&nested).expect("error creating directory");
        std::fs::write(tmp_dir.path().join("a/requirements.txt"), "jax\n").expect("error writing file");

        let found = find_requirements(&nested).expect("requirements should be found");
        assert_eq!(found, tmp_dir.path().join("a/requirements.txt"));
    }

    #[test]
    fn test_select_backend_auto_routes_multi_host_to_leader_worker() {
        let multi_host = parse_accelerator("v3-8").unwrap();
        let single_host = parse_accelerator("v5litepod-4").unwrap();
        let cpu = parse_accelerator("cpu").unwrap();

        assert_eq!(select_backend(BackendKind::Auto, &multi_host).unwrap(), BackendKind::LeaderWorker);
        assert_eq!(select_backend(BackendKind::Auto, &single_host).unwrap(), BackendKind::SinglePod);
        assert_eq!(select_backend(BackendKind::Auto, &cpu).unwrap(), BackendKind::SinglePod);
    }

    #[test]
    fn test_select_backend_rejects_invalid_pairings() {
        let multi_host = parse_accelerator("v3-8").unwrap();
        let gpu = parse_accelerator("l4").unwrap();
        let single_host = parse_accelerator("v5litepod-4").unwrap();

        assert!(matches!(
            select_backend(BackendKind::SinglePod, &multi_host),
            Err(RemoteError::Config(_))
        ));
        assert!(matches!(
            select_backend(BackendKind::LeaderWorker, &gpu),
            Err(RemoteError::Config(_))
        ));
        // explicitly choosing leader-worker for a single-host slice is allowed
        assert_eq!(
            select_backend(BackendKind::LeaderWorker, &single_host).unwrap(),
            BackendKind::LeaderWorker
        );
    }

    #[test]
    fn test_job_context_derivations() {
        let tmp_dir = TempDir::new("execution").expect("error creating temporary dir");
        let options = RemoteOptions {
            accelerator: "v3-8".to_string(),
            zone: Some("europe-west4-b".to_string()),
            ..test_options(tmp_dir.path())
        };

        let ctx = JobContext::from_options("train", test_payload(), &options).expect("context should build");

        assert_eq!(ctx.region, "europe-west4");
        assert_eq!(ctx.bucket_name, "my-project-keras-remote-jobs");
        assert!(ctx.display_name.starts_with("keras-remote-train-job-"));
        assert_eq!(ctx.context_uri(), format!("gs://my-project-keras-remote-jobs/{}/context.tar.gz", ctx.job_id));
        assert_eq!(ctx.payload_uri(), format!("gs://my-project-keras-remote-jobs/{}/payload.json", ctx.job_id));
        assert_eq!(ctx.result_uri(), format!("gs://my-project-keras-remote-jobs/{}/result.json", ctx.job_id));
    }

    #[test]
    fn test_execute_remote_happy_path() {
        let tmp_dir = TempDir::new("execution").expect("error creating temporary dir");
        std::fs::write(tmp_dir.path().join("train.py"), "x").expect("error writing file");

        let services = services_with_result(&tmp_dir, Some(&ResultEnvelope::ok(json!(5))));
        let backend = StubBackend::new(None);
        let mut ctx =
            JobContext::from_options("add", test_payload(), &test_options(tmp_dir.path())).expect("context");

        let result = execute_remote(&mut ctx, &backend, &services).expect("execution should succeed");

        assert_eq!(result, json!(5));
        assert_eq!(*backend.events.borrow(), vec!["submit", "wait", "cleanup"]);
        assert_eq!(ctx.image_uri.as_deref(), Some("gcr.io/my-project/custom:latest"));
        assert!(ctx.payload_path.is_some());
        assert!(ctx.context_path.is_some());
    }

    #[test]
    fn test_execute_remote_surfaces_job_error_when_result_absent() {
        let tmp_dir = TempDir::new("execution").expect("error creating temporary dir");

        let services = services_with_result(&tmp_dir, None);
        let backend = StubBackend::new(Some(RemoteError::Job("exit code 137".to_string())));
        let mut ctx =
            JobContext::from_options("add", test_payload(), &test_options(tmp_dir.path())).expect("context");

        let error = execute_remote(&mut ctx, &backend, &services).unwrap_err();

        assert!(matches!(error, RemoteError::Job(_)));
        assert!(error.to_string().contains("exit code 137"));
        // cleanup still ran even though the wait failed
        assert_eq!(*backend.events.borrow(), vec!["submit", "wait", "cleanup"]);
    }

    #[test]
    fn test_execute_remote_prefers_runner_report_over_job_error() {
        let tmp_dir = TempDir::new("execution").expect("error creating temporary dir");

        let envelope = ResultEnvelope::failed(
            RemoteException {
                kind: "ValueError".to_string(),
                message: "x".to_string(),
            },
            "ValueError: x".to_string(),
        );
        let services = services_with_result(&tmp_dir, Some(&envelope));
        let backend = StubBackend::new(Some(RemoteError::Job("job failed".to_string())));
        let mut ctx =
            JobContext::from_options("bad", test_payload(), &test_options(tmp_dir.path())).expect("context");

        let error = execute_remote(&mut ctx, &backend, &services).unwrap_err();

        match error {
            RemoteError::RemoteExecution { kind, message, .. } => {
                assert_eq!(kind, "ValueError");
                assert_eq!(message, "x");
            }
            other => panic!("expected RemoteExecution, got {other}"),
        }
    }
}
