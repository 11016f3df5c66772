//! Shared test utilities for stackherd
//!
//! This crate provides test helpers that depend on the deployer crate,
//! which is why they live outside it.
//!
//! ## Modules
//!
//! - [`aws`]: AWS region detection and unique stack names
//! - [`fake_cloud`]: stateful in-memory implementation of every collaborator
//! - [`fixtures`]: stack configs and template trees

pub mod aws;
pub mod fake_cloud;
pub mod fixtures;

// Re-export commonly used items
pub use aws::{get_test_region, test_run_id, test_stack_name};
pub use fake_cloud::{ACCOUNT_ID, FakeCloud, stack_resource};
pub use fixtures::{TemplateTree, function_tree, output_ref, stack_config};
