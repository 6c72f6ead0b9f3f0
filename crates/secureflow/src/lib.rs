//! Least-privilege and supply-chain hardening for CI workflows.
//!
//! The entry point is [`pipeline::secure_workflow`], which runs each
//! hardening stage over a workflow's text and returns the rewritten text
//! along with a [`report::WorkflowReport`]. Each stage is also usable on
//! its own.

pub mod config;
pub mod github;
pub mod harden;
pub mod knowledge_base;
pub mod maintained;
pub mod missing;
pub mod oci_registry;
pub mod permissions;
pub mod pin;
pub mod pipeline;
pub mod remote;
pub mod report;

/// The user agent sent with every outbound request.
pub(crate) const SECUREFLOW_AGENT: &str =
    concat!("secureflow/", env!("CARGO_PKG_VERSION"), " (secureflow)");

/// Returns whether `value` carries the platform token, i.e. references
/// `secrets.GITHUB_TOKEN` or `github.token` in any casing.
pub fn is_platform_token(value: &str) -> bool {
    let value = value.to_lowercase();
    value.contains("secrets.github_token") || value.contains("github.token")
}

/// The canonical spelling of the platform token in a workflow.
pub const PLATFORM_TOKEN: &str = "${{ secrets.GITHUB_TOKEN }}";
