//! stackherd-common - Shared types and utilities
//!
//! This crate provides the vocabulary shared by the deployer and its test
//! fakes, without any AWS SDK dependencies to keep it lightweight.
//!
//! ## Modules
//!
//! - [`arn`]: ARN parsing and construction for reclaimable resources
//! - [`defaults`]: Default engine configuration values
//! - [`resource_kind`]: Reclaimable resource types and their CloudFormation mapping
//! - [`status`]: Closed stack and change-set status taxonomy
//! - [`tags`]: Tag schema used for discovery and garbage collection

pub mod arn;
pub mod defaults;
pub mod resource_kind;
pub mod status;
pub mod tags;

pub use arn::{Arn, ArnError, partition_for_region};
pub use resource_kind::ResourceKind;
pub use status::{ChangeSetStatus, Phase, StackStatus};
