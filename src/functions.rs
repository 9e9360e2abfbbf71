use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Failure raised by a remote callable. Carries the error kind the way an
/// exception carries its type name, so the caller can surface it faithfully.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct InvokeError {
    pub kind: String,
    pub message: String,
}

impl InvokeError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        InvokeError {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

pub type CallResult = Result<Value, InvokeError>;

/// A function invocable on the remote side. Arguments and results travel as
/// JSON values; captured state must be passed as explicit arguments since
/// Rust cannot serialize closures at runtime.
pub trait RemoteCallable: Send + Sync {
    fn call(&self, args: &[Value], kwargs: &BTreeMap<String, Value>) -> CallResult;
}

impl<F> RemoteCallable for F
where
    F: Fn(&[Value], &BTreeMap<String, Value>) -> CallResult + Send + Sync,
{
    fn call(&self, args: &[Value], kwargs: &BTreeMap<String, Value>) -> CallResult {
        self(args, kwargs)
    }
}

/// Name -> callable mapping shared by the local decorator surface and the
/// in-container runner. The runner binary must be built with the same
/// registrations linked in, so a payload's function reference resolves on
/// both sides.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<dyn RemoteCallable>>>,
}

static GLOBAL_REGISTRY: Lazy<FunctionRegistry> = Lazy::new(FunctionRegistry::default);

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry::default()
    }

    /// The process-wide registry used by `remote-runner` and the decorator
    /// surface.
    pub fn global() -> &'static FunctionRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register a callable under `name`. Re-registering replaces the previous
    /// entry; last registration wins.
    pub fn register<C>(&self, name: impl Into<String>, callable: C)
    where
        C: RemoteCallable + 'static,
    {
        self.functions
            .write()
            .expect("function registry lock poisoned")
            .insert(name.into(), Arc::new(callable));
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn RemoteCallable>> {
        self.functions
            .read()
            .expect("function registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }
}
