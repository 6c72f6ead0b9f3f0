//! Data models for CI workflows and for the per-action security metadata
//! that hardening consults.
//!
//! The models read only what hardening needs. They never round-trip: all
//! rewriting happens on the original text, positioned with `yamlanchor`.

#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::redundant_field_names)]
#![forbid(unsafe_code)]

pub mod action_metadata;
pub mod common;
pub mod workflow;
