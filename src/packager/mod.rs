use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Component, Path};
use thiserror::Error;
use walkdir::WalkDir;

/// Directory components never shipped to the remote side.
const EXCLUDED_COMPONENTS: &[&str] = &[".git", "__pycache__"];

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum PackagerError {
    #[error("Cannot archive directory `{directory}`: {raw_error_message:?}")]
    CannotArchiveDirectory {
        directory: String,
        raw_error_message: String,
    },
    #[error("Cannot extract archive `{archive}`: {raw_error_message:?}")]
    CannotExtractArchive {
        archive: String,
        raw_error_message: String,
    },
    #[error("Cannot serialize payload to `{path}`: {raw_error_message:?}")]
    CannotSerializePayload { path: String, raw_error_message: String },
    #[error("Cannot deserialize payload from `{path}`: {raw_error_message:?}")]
    CannotDeserializePayload { path: String, raw_error_message: String },
}

/// Reference to a function registered in the `FunctionRegistry`. Rust has no
/// runtime callable serialization, so the payload names the function and the
/// remote registry resolves it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub name: String,
}

impl FunctionRef {
    pub fn new(name: impl Into<String>) -> Self {
        FunctionRef { name: name.into() }
    }
}

/// Everything the remote runner needs to invoke the user function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub func: FunctionRef,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub env_vars: BTreeMap<String, String>,
}

/// What the remote side reports back. `kind` mirrors an exception type name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    pub kind: String,
    pub message: String,
}

/// Serialized object the runner writes to object storage: either the return
/// value or the captured failure, never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteException>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ResultEnvelope {
    pub fn ok(result: Value) -> Self {
        ResultEnvelope {
            success: true,
            result: Some(result),
            exception: None,
            traceback: None,
        }
    }

    pub fn failed(exception: RemoteException, traceback: String) -> Self {
        ResultEnvelope {
            success: false,
            result: None,
            exception: Some(exception),
            traceback: Some(traceback),
        }
    }
}

/// Write the payload envelope to `out`. Callers treat the file as opaque.
pub fn save_payload(payload: &Payload, out: &Path) -> Result<(), PackagerError> {
    let file = File::create(out).map_err(|e| PackagerError::CannotSerializePayload {
        path: out.to_string_lossy().to_string(),
        raw_error_message: e.to_string(),
    })?;

    serde_json::to_writer(BufWriter::new(file), payload).map_err(|e| PackagerError::CannotSerializePayload {
        path: out.to_string_lossy().to_string(),
        raw_error_message: e.to_string(),
    })
}

pub fn load_payload(path: &Path) -> Result<Payload, PackagerError> {
    let file = File::open(path).map_err(|e| PackagerError::CannotDeserializePayload {
        path: path.to_string_lossy().to_string(),
        raw_error_message: e.to_string(),
    })?;

    serde_json::from_reader(BufReader::new(file)).map_err(|e| PackagerError::CannotDeserializePayload {
        path: path.to_string_lossy().to_string(),
        raw_error_message: e.to_string(),
    })
}

pub fn save_result(envelope: &ResultEnvelope, out: &Path) -> Result<(), PackagerError> {
    let file = File::create(out).map_err(|e| PackagerError::CannotSerializePayload {
        path: out.to_string_lossy().to_string(),
        raw_error_message: e.to_string(),
    })?;

    serde_json::to_writer(BufWriter::new(file), envelope).map_err(|e| PackagerError::CannotSerializePayload {
        path: out.to_string_lossy().to_string(),
        raw_error_message: e.to_string(),
    })
}

pub fn load_result(path: &Path) -> Result<ResultEnvelope, PackagerError> {
    let file = File::open(path).map_err(|e| PackagerError::CannotDeserializePayload {
        path: path.to_string_lossy().to_string(),
        raw_error_message: e.to_string(),
    })?;

    serde_json::from_reader(BufReader::new(file)).map_err(|e| PackagerError::CannotDeserializePayload {
        path: path.to_string_lossy().to_string(),
        raw_error_message: e.to_string(),
    })
}

fn is_excluded(relative_path: &Path) -> bool {
    relative_path.components().any(|component| match component {
        Component::Normal(name) => EXCLUDED_COMPONENTS.iter().any(|excluded| OsStr::new(excluded) == name),
        _ => false,
    })
}

/// Archive every regular file under `root` into a gzipped tar at `out`.
/// Paths inside the archive are relative to `root`; files under `.git` or
/// `__pycache__` are skipped and empty directories are omitted. The walk is
/// sorted so identical trees produce identical archives.
pub fn archive_working_dir(root: &Path, out: &Path) -> Result<(), PackagerError> {
    let to_error = |e: &dyn std::fmt::Display| PackagerError::CannotArchiveDirectory {
        directory: root.to_string_lossy().to_string(),
        raw_error_message: e.to_string(),
    };

    let archive_file = File::create(out).map_err(|e| to_error(&e))?;
    let encoder = GzEncoder::new(archive_file, Compression::fast());
    let mut tar = tar::Builder::new(encoder);

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match &entry {
            Ok(entry) => entry.path(),
            Err(err) => {
                error!("Cannot read file {:?}", err);
                continue;
            }
        };

        if !entry.is_file() {
            continue;
        }

        let relative_path = entry.strip_prefix(root).map_err(|e| to_error(&e))?;
        if is_excluded(relative_path) {
            continue;
        }

        tar.append_path_with_name(entry, relative_path).map_err(|e| to_error(&e))?;
    }

    tar.into_inner().and_then(|encoder| encoder.finish()).map_err(|e| to_error(&e))?;

    Ok(())
}

/// Extract a context archive produced by `archive_working_dir` into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<(), PackagerError> {
    let to_error = |e: &dyn std::fmt::Display| PackagerError::CannotExtractArchive {
        archive: archive.to_string_lossy().to_string(),
        raw_error_message: e.to_string(),
    };

    let file = File::open(archive).map_err(|e| to_error(&e))?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(dest).map_err(|e| to_error(&e))?;

    Ok(())
}
