//! AWS error classification and handling
//!
//! Provides typed errors for AWS SDK operations using the `.code()` method
//! instead of string matching on Debug format.

use aws_sdk_cloudformation::error::ProvideErrorMetadata;
use thiserror::Error;

/// AWS error categories for retry and cleanup logic
#[derive(Debug, Clone, Error)]
pub enum AwsError {
    /// Resource was not found (safe to skip in cleanup)
    #[error("Resource not found: {resource_id}")]
    NotFound { resource_id: String },

    /// Rate limit exceeded (retryable with backoff)
    #[error("Rate limit exceeded")]
    Throttled,

    /// A service quota was hit, e.g. too many change sets on one stack
    #[error("Limit exceeded: {message}")]
    LimitExceeded { message: String },

    /// CloudFormation rejected an update that changes nothing
    #[error("No changes to deploy: {message}")]
    NoChanges { message: String },

    /// Generic AWS SDK error with code and message
    #[error("AWS error: {message}")]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

impl AwsError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound { .. })
    }

    /// Check if this is a quota error
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, AwsError::LimitExceeded { .. })
    }

    /// Get a user-friendly suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            AwsError::Sdk { code: Some(c), .. } => suggestion_for_code(c),
            AwsError::LimitExceeded { .. } => suggestion_for_code("LimitExceededException"),
            AwsError::Throttled => suggestion_for_code("Throttling"),
            _ => None,
        }
    }
}

/// Known AWS error codes for "not found" conditions
const NOT_FOUND_CODES: &[&str] = &[
    "NotFound",
    "NoSuchBucket",
    "NoSuchKey",
    "NoSuchEntity",
    "NoSuchDistribution",
    "ChangeSetNotFound",
    "ChangeSetNotFoundException",
    "ResourceNotFoundException",
    "RepositoryNotFoundException",
    "ImageNotFoundException",
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
];

/// Known AWS error codes for throttling/rate limiting
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "SlowDown",
];

/// Known AWS error codes for service quotas
const LIMIT_CODES: &[&str] = &["LimitExceededException", "LimitExceeded"];

/// Messages CloudFormation uses for an update without changes
pub const NO_CHANGES_PATTERNS: &[&str] = &[
    "The submitted information didn't contain changes",
    "No updates are to be performed",
];

/// Check whether a failure reason means "nothing to deploy"
pub fn is_no_changes_reason(reason: &str) -> bool {
    NO_CHANGES_PATTERNS.iter().any(|p| reason.contains(p))
}

/// Classify an AWS SDK error using the error code.
pub fn classify_aws_error(code: Option<&str>, message: Option<&str>) -> AwsError {
    let message = message.unwrap_or("Unknown error").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound {
            resource_id: message,
        },
        Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled,
        Some(c) if LIMIT_CODES.contains(&c) => AwsError::LimitExceeded { message },
        // CloudFormation reports both of these as a plain ValidationError
        Some("ValidationError") if message.contains("does not exist") => AwsError::NotFound {
            resource_id: message,
        },
        Some("ValidationError") if is_no_changes_reason(&message) => {
            AwsError::NoChanges { message }
        }
        _ => AwsError::Sdk {
            code: code.map(|s| s.to_string()),
            message,
        },
    }
}

/// Classify a typed SDK error at the call site.
///
/// `SdkError<E, R>` implements `ProvideErrorMetadata` for every service, so
/// this is the single conversion point from the SDK into `AwsError`. Errors
/// without a service code (dispatch, timeout) keep their display chain.
pub fn classify_sdk_error<E>(err: E) -> AwsError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let meta = err.meta();
    match meta.code() {
        Some(code) => classify_aws_error(Some(code), meta.message()),
        None => AwsError::Sdk {
            code: None,
            message: aws_sdk_cloudformation::error::DisplayErrorContext(&err).to_string(),
        },
    }
}

/// Classify an error from an anyhow::Error.
///
/// Walks the error chain looking for an `AwsError` produced by
/// `classify_sdk_error`. Falls back to string matching on the Debug
/// representation if no typed error is found.
pub fn classify_anyhow_error(error: &anyhow::Error) -> AwsError {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<AwsError>() {
            return e.clone();
        }
    }

    // Fallback: extract error code from debug string representation
    let debug_str = format!("{:?}", error);
    if let Some(code) = extract_error_code(&debug_str) {
        return classify_aws_error(Some(&code), Some(&debug_str));
    }

    AwsError::Sdk {
        code: None,
        message: error.to_string(),
    }
}

/// Treat "not found" as success for idempotent deletes.
pub fn ignore_not_found(result: anyhow::Result<()>) -> anyhow::Result<()> {
    match result {
        Err(e) if classify_anyhow_error(&e).is_not_found() => Ok(()),
        other => other,
    }
}

/// Extract an AWS error code from a debug string representation
fn extract_error_code(debug_str: &str) -> Option<String> {
    let known = NOT_FOUND_CODES
        .iter()
        .chain(THROTTLING_CODES)
        .chain(LIMIT_CODES);
    for code in known {
        if debug_str.contains(code) {
            return Some((*code).to_string());
        }
    }

    // Try to extract any code from `code: Some("...")` pattern
    if let Some(start) = debug_str.find("code: Some(\"") {
        let rest = &debug_str[start + 12..];
        if let Some(end) = rest.find('"') {
            return Some(rest[..end].to_string());
        }
    }

    None
}

/// Error code to user-friendly suggestion mapping
const SUGGESTIONS: &[(&str, &str)] = &[
    (
        "LimitExceededException",
        "Delete unused change sets or stacks, or request a quota increase.",
    ),
    (
        "InsufficientCapabilitiesException",
        "Add the missing capability to the stack's `capabilities` list.",
    ),
    (
        "AccessDenied",
        "Check that the active AWS profile may call this API in this region.",
    ),
    (
        "AccessDeniedException",
        "Check that the active AWS profile may call this API in this region.",
    ),
    (
        "ExpiredToken",
        "Refresh your AWS credentials and run the command again.",
    ),
    (
        "Throttling",
        "AWS API rate limit hit. Lower STACKHERD_RATE_LIMIT and retry.",
    ),
];

/// Get a user-friendly suggestion for a known error code.
fn suggestion_for_code(code: &str) -> Option<String> {
    SUGGESTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, s)| (*s).to_string())
}
