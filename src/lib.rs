#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_yaml;
#[macro_use]
extern crate serde_json;

extern crate chrono;
extern crate dirs;
extern crate openssl_probe;
extern crate petgraph;
extern crate regex;
extern crate reqwest;
extern crate semver;
extern crate sha2;
extern crate threadpool;

#[macro_use]
extern crate log;

#[macro_use]
extern crate error_chain;
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {}
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error) #[cfg(unix)];
        Int(::std::num::ParseIntError);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
        Reqw(reqwest::UrlError);
        Reqe(reqwest::Error);
        Time(::std::time::SystemTimeError);
    }
    errors {
        MissingField(path: String) {
            description("manifest field missing")
            display("required manifest field '{}' is missing", path)
        }
        InvalidType(path: String, expected: &'static str) {
            description("manifest field has wrong type")
            display("manifest field '{}' must be a {}", path, expected)
        }
        InvalidValue(path: String, reason: String) {
            description("manifest field has invalid value")
            display("manifest field '{}' is invalid: {}", path, reason)
        }
        UnknownRelease(name: String) {
            description("release not declared in deployment")
            display("release '{}' is not declared in the deployment", name)
        }
        UnknownResourcePool(name: String) {
            description("resource pool not declared in deployment")
            display("resource pool '{}' is not declared in the deployment", name)
        }
        UnknownNetwork(name: String) {
            description("network not declared in deployment")
            display("network '{}' is not declared in the deployment", name)
        }
        InvalidTemplates(job: String, reason: String) {
            description("job templates do not resolve")
            display("templates of job '{}' {}", job, reason)
        }
        IncompatibleSpecs(job: String) {
            description("job mixes templates with and without property schemas")
            display("job '{}' mixes templates with and without property schemas", job)
        }
        InvalidPropertyMapping(job: String, path: String) {
            description("property mapping source missing")
            display("property mapping for job '{}' references missing path '{}'", job, path)
        }
        MissingProperty(job: String, path: String) {
            description("required property missing")
            display("job '{}' requires property '{}' which has no value or default", job, path)
        }
        CpiError(op: String, reason: String) {
            description("cloud provider call failed")
            display("cloud call {} failed: {}", op, reason)
        }
        AgentUnreachable(instance: String) {
            description("agent did not respond")
            display("agent for {} is unreachable", instance)
        }
        AgentNotReady(instance: String, waited_ms: u64) {
            description("agent did not become ready in the watch window")
            display("{} not running after waiting {}ms", instance, waited_ms)
        }
        DiskAttachmentFailed(instance: String) {
            description("persistent disk could not be attached")
            display("failed to attach persistent disk for {}", instance)
        }
        CompilationFailed(release: String, reason: String) {
            description("package compilation failed")
            display("compilation of release '{}' failed: {}", release, reason)
        }
        LockUnavailable(name: String) {
            description("lock is held elsewhere")
            display("lock '{}' is unavailable", name)
        }
        Cancelled {
            description("deployment was cancelled")
            display("deployment was cancelled")
        }
        StoreTransactionFailed(reason: String) {
            description("store transaction failed")
            display("store transaction failed: {}", reason)
        }
        InvariantViolated(reason: String) {
            description("internal invariant violated")
            display("internal invariant violated: {} - bug!", reason)
        }
    }
}

/// Map an error onto the CLI exit code contract
///
/// 0 success, 1 validation error, 2 runtime failure, 3 cancelled, 4 lock unavailable.
pub fn exit_code(e: &Error) -> i32 {
    match e.kind() {
        ErrorKind::MissingField(..)
        | ErrorKind::InvalidType(..)
        | ErrorKind::InvalidValue(..)
        | ErrorKind::UnknownRelease(..)
        | ErrorKind::UnknownResourcePool(..)
        | ErrorKind::UnknownNetwork(..)
        | ErrorKind::InvalidTemplates(..)
        | ErrorKind::IncompatibleSpecs(..)
        | ErrorKind::InvalidPropertyMapping(..)
        | ErrorKind::MissingProperty(..) => 1,
        ErrorKind::Cancelled => 3,
        ErrorKind::LockUnavailable(..) => 4,
        _ => 2,
    }
}

/// Orchestrator configuration file
pub mod config;
pub use config::Config;

/// Injectable clocks for watch windows and event timestamps
pub mod clock;

/// Dynamic manifest trees and typed field access
pub mod manifest;

/// The deployment plan graph parsed from a manifest
pub mod plan;
pub use plan::Plan;

/// In-memory transactional record store
pub mod store;
pub use store::Store;

/// Cloud provider interface (create/delete VMs and disks)
pub mod cpi;

/// VM agent RPC client using `reqwest`
pub mod agent;

/// Deployment and release locks
pub mod lock;

/// The structured event log stream and its renderer
pub mod eventlog;

/// Binding store records to the plan and classifying transitions
pub mod assemble;

/// Canary/batch rollout engines
pub mod update;

/// One full apply of a deployment manifest
pub mod deploy;
pub use deploy::{DeployOpts, Deployer};

/// Smart initialiser with safety
pub fn init() -> Result<()> {
    openssl_probe::init_ssl_cert_env_vars(); // prerequisite for https agent clients
    Ok(())
}
