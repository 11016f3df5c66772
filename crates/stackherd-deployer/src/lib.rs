//! stackherd - Dependency-ordered CloudFormation deployments
//!
//! This crate deploys and deletes sets of stacks in dependency order,
//! packages the local artifacts their templates reference, and collects
//! what deleted stacks leave behind.

pub mod aws;
pub mod changeset;
pub mod config;
pub mod deployer;
pub mod packaging;
pub mod poller;
pub mod reclaim;
pub mod scheduler;
pub mod stackfile;
pub mod throttle;
pub mod wait;

pub use deployer::{CleanupReport, DeleteReport, Deployer, PackagedTemplate};
pub use scheduler::{GraphMode, GraphReport};
pub use stackfile::{StackConfig, StackFile, StackRef};
