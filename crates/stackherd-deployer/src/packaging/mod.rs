//! Content-addressed packaging of local artifacts
//!
//! A template may reference local paths from a fixed set of resource
//! properties (see [`descriptors`]). Packaging discovers every such path,
//! including paths referenced by nested templates, uploads each one exactly
//! once to a content-addressed location, and rewrites the templates to point
//! at the uploaded copies.

pub mod descriptors;
pub mod engine;
pub mod file;
pub mod hashing;
pub mod template;

use std::path::PathBuf;

use thiserror::Error;

pub use descriptors::{ObjectRef, PropertyDescriptor};
pub use engine::{PackageOutcome, PackagingEngine};
pub use file::{Archive, Destination, FileStatus, PackagedFile, PackagedLocation, S3Location};
pub use template::{Template, TemplateFormat};

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("{template} references {path}, which does not exist")]
    MissingPath { path: PathBuf, template: PathBuf },

    #[error("{path} is referenced with two different packaging destinations")]
    ConflictingDestination { path: PathBuf },

    #[error("{path} is a directory but its property only accepts a single file")]
    DirectoryNotAllowed { path: PathBuf },

    #[error("packaged {packaged} of {expected} files")]
    CountMismatch { expected: usize, packaged: usize },

    #[error("stack {stack} packages artifacts to S3 but has no bucket")]
    MissingBucket { stack: String },

    #[error("stack {stack} packages container images but has no repository")]
    MissingRepository { stack: String },

    #[error("nested templates form a cycle through {path}")]
    TemplateCycle { path: PathBuf },

    #[error("template {path}: {message}")]
    Template { path: PathBuf, message: String },

    #[error("{codec} property cannot point at {location}")]
    UnexpectedLocation {
        codec: &'static str,
        location: String,
    },
}
