use crate::errors::RemoteError;
use crate::functions::{FunctionRegistry, RemoteCallable};
use crate::object_storage::{ObjectStorageService, parse_gs_uri};
use crate::packager::{self, Payload, RemoteException, ResultEnvelope};
use std::panic::AssertUnwindSafe;
use std::path::Path;

/// In-container entrypoint: hydrate the workspace, execute the payload,
/// report the outcome. Exits 0 iff the user function succeeded.
pub fn main() -> ! {
    let args: Vec<String> = std::env::args().skip(1).collect();
    std::process::exit(run(&args, FunctionRegistry::global()))
}

/// Invocation contract: `remote_runner <contextURI> <payloadURI> <resultURI>`.
///
/// Exit 0 means a success envelope was written; exit 1 is either a captured
/// user failure (envelope written with success=false) or an infrastructure
/// failure (no envelope), which the local caller tells apart by the result
/// object's presence.
pub fn run(args: &[String], registry: &FunctionRegistry) -> i32 {
    if args.len() < 3 {
        eprintln!("Usage: remote_runner <context_uri> <payload_uri> <result_uri>");
        return 1;
    }

    match execute(&args[0], &args[1], &args[2], registry) {
        Ok(success) => {
            println!("[REMOTE] Execution complete");
            if success { 0 } else { 1 }
        }
        Err(e) => {
            eprintln!("[REMOTE] FATAL ERROR: {e}");
            1
        }
    }
}

fn execute(
    context_uri: &str,
    payload_uri: &str,
    result_uri: &str,
    registry: &FunctionRegistry,
) -> Result<bool, RemoteError> {
    println!("[REMOTE] Starting execution");

    // In-container ambient credentials (workload identity).
    let storage = ObjectStorageService::new().map_err(|e| RemoteError::Credential(e.to_string()))?;

    let temp_dir = std::env::temp_dir();
    let context_path = temp_dir.join("context.tar.gz");
    let payload_path = temp_dir.join("payload.json");
    let result_path = temp_dir.join("result.json");
    let workspace_dir = temp_dir.join("workspace");

    println!("[REMOTE] Downloading artifacts...");
    let (context_bucket, context_key) = parse_gs_uri(context_uri)?;
    storage.download_to_file(&context_bucket, &context_key, &context_path)?;
    let (payload_bucket, payload_key) = parse_gs_uri(payload_uri)?;
    storage.download_to_file(&payload_bucket, &payload_key, &payload_path)?;

    prepare_workspace(&context_path, &workspace_dir)?;
    // The shipped source tree becomes the working directory, so the function
    // resolves its data files exactly as it would locally.
    std::env::set_current_dir(&workspace_dir).map_err(|e| RemoteError::Io(e.to_string()))?;

    println!("[REMOTE] Loading function payload");
    let payload = packager::load_payload(&payload_path)?;
    apply_env_vars(&payload);

    let callable = registry.resolve(&payload.func.name).ok_or_else(|| {
        RemoteError::Config(format!(
            "function `{}` is not registered in this runner; rebuild the runner image with the registration linked in",
            payload.func.name
        ))
    })?;

    println!("[REMOTE] Executing {}()", payload.func.name);
    let envelope = invoke_captured(callable.as_ref(), &payload);
    match &envelope.exception {
        None => println!("[REMOTE] Function completed successfully"),
        Some(exception) => println!("[REMOTE] ERROR: {}: {}", exception.kind, exception.message),
    }

    // Uploaded whenever invocation completed, even on user failure: the
    // local caller relies on result presence to distinguish infrastructure
    // failure from user failure.
    println!("[REMOTE] Uploading result...");
    packager::save_result(&envelope, &result_path)?;
    let (result_bucket, result_key) = parse_gs_uri(result_uri)?;
    storage.upload_from_file(&result_bucket, &result_key, &result_path)?;

    Ok(envelope.success)
}

/// Wipe and recreate the workspace, then unpack the context archive into it.
pub fn prepare_workspace(context_archive: &Path, workspace_dir: &Path) -> Result<(), RemoteError> {
    if workspace_dir.exists() {
        std::fs::remove_dir_all(workspace_dir).map_err(|e| RemoteError::Io(e.to_string()))?;
    }
    std::fs::create_dir_all(workspace_dir).map_err(|e| RemoteError::Io(e.to_string()))?;

    packager::extract_archive(context_archive, workspace_dir)?;
    Ok(())
}

/// Apply the captured environment process-wide before invocation; it lives
/// until the runner process exits.
fn apply_env_vars(payload: &Payload) {
    if payload.env_vars.is_empty() {
        return;
    }

    println!("[REMOTE] Setting {} environment variables", payload.env_vars.len());
    for (name, value) in &payload.env_vars {
        // The runner is single-threaded at this point; no reader races the
        // environment mutation.
        unsafe {
            std::env::set_var(name, value);
        }
    }
}

/// Invoke the callable behind a catch boundary: structured failures are
/// captured as-is, panics are re-wrapped as an execution error carrying the
/// panic payload.
pub fn invoke_captured(callable: &dyn RemoteCallable, payload: &Payload) -> ResultEnvelope {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callable.call(&payload.args, &payload.kwargs)));

    match outcome {
        Ok(Ok(result)) => ResultEnvelope::ok(result),
        Ok(Err(invoke_error)) => {
            let traceback = format!("{}: {}", invoke_error.kind, invoke_error.message);
            ResultEnvelope::failed(
                RemoteException {
                    kind: invoke_error.kind,
                    message: invoke_error.message,
                },
                traceback,
            )
        }
        Err(panic_payload) => {
            let message = panic_message(panic_payload.as_ref());
            ResultEnvelope::failed(
                RemoteException {
                    kind: "RuntimeError".to_string(),
                    message: format!("panic: {message}"),
                },
                format!("RuntimeError: panic: {message}"),
            )
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
