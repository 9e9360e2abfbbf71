extern crate tera;
#[macro_use]
extern crate tracing;

pub mod accelerator;
pub mod build_platform;
pub mod constants;
pub mod container_registry;
pub mod errors;
pub mod execution;
pub mod functions;
pub mod kubernetes;
pub mod logger;
pub mod object_storage;
pub mod packager;
pub mod runner;
pub mod runtime;
