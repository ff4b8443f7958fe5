//! Error taxonomy for PAPI
//!
//! Every controller translates lower-level failures into this fixed set of
//! kinds at its boundary; the HTTP edge maps each kind to a status code in
//! one place. No upstream stack detail leaves the HTTP surface except for
//! `Backend`, which deliberately carries the upstream message verbatim.

use thiserror::Error;

/// Result type for PAPI operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for PAPI operations
#[derive(Debug, Error)]
pub enum Error {
    /// Token validation failed (invalid, expired, missing claims)
    #[error("authentication failed: {message}")]
    AuthFailed {
        /// Description of what's wrong with the token
        message: String,
    },

    /// The caller holds no allow-listed VO, or requested a VO outside their set
    #[error("not a member: {message}")]
    NotMember {
        /// Description of the membership mismatch
        message: String,
    },

    /// Schema or parameter violation in a user-supplied configuration
    #[error("bad request for '{field}': {message}")]
    BadRequest {
        /// Pointer to the offending field (e.g. "hardware.gpu_num")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Catalog lookup miss
    #[error("unknown workload: no {kind} named '{name}' in the catalog")]
    UnknownWorkload {
        /// Workload kind that was looked up
        kind: String,
        /// Item name that was not found
        name: String,
    },

    /// Admission denial from the quota ledger
    #[error("quota exceeded for {resource}: limit {limit}, current {current}")]
    QuotaExceeded {
        /// The constrained resource (e.g. "GPU", "tryme-concurrency")
        resource: String,
        /// The configured cap
        limit: u64,
        /// Usage observed at check time
        current: u64,
    },

    /// Ownership mismatch (operating on another user's deployment or secret)
    #[error("forbidden: {message}")]
    Forbidden {
        /// Description of the denied operation
        message: String,
    },

    /// Passthrough failure from the Scheduler, Registry or Secret Store
    #[error("backend error [{upstream}]: {message}")]
    Backend {
        /// Which upstream failed (e.g. "nomad", "vault", "harbor")
        upstream: String,
        /// Upstream message, verbatim
        message: String,
    },

    /// Outbound call exceeded its deadline
    #[error("timeout during {operation}")]
    Timeout {
        /// The operation that timed out (e.g. "nomad list jobs")
        operation: String,
    },

    /// Unexpected internal failure; full detail is logged, not returned
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where it failed (e.g. "catalog", "stats-poller")
        context: String,
    },
}

impl Error {
    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: msg.into(),
        }
    }

    /// Create a membership error
    pub fn not_member(msg: impl Into<String>) -> Self {
        Self::NotMember {
            message: msg.into(),
        }
    }

    /// Create a bad-request error pointing at a specific field
    pub fn bad_request(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BadRequest {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create an unknown-workload error
    pub fn unknown_workload(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::UnknownWorkload {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a quota-exceeded error
    pub fn quota(resource: impl Into<String>, limit: u64, current: u64) -> Self {
        Self::QuotaExceeded {
            resource: resource.into(),
            limit,
            current,
        }
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden {
            message: msg.into(),
        }
    }

    /// Create a backend error carrying the upstream message verbatim
    pub fn backend(upstream: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Backend {
            upstream: upstream.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether an outbound *read* that produced this error may be retried.
    ///
    /// Writes (job submit, secret put, image push) are never retried by
    /// PAPI regardless of this flag; the user must re-submit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Backend { .. } | Error::Timeout { .. })
    }

    /// Short stable kind string, used in logs and response bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AuthFailed { .. } => "auth-failed",
            Error::NotMember { .. } => "not-member",
            Error::BadRequest { .. } => "bad-request",
            Error::UnknownWorkload { .. } => "unknown-workload",
            Error::QuotaExceeded { .. } => "quota-exceeded",
            Error::Forbidden { .. } => "forbidden",
            Error::Backend { .. } => "backend-error",
            Error::Timeout { .. } => "timeout",
            Error::Internal { .. } => "internal-error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a schema violation points the user at the offending field
    ///
    /// When a submitted deployment config fails validation, the error names
    /// the field so the dashboard can highlight it.
    #[test]
    fn story_bad_request_names_the_field() {
        let err = Error::bad_request("hardware.cpu_num", "should be smaller or equal to 8");
        assert!(err.to_string().contains("hardware.cpu_num"));
        assert!(err.to_string().contains("smaller or equal"));
        assert_eq!(err.kind(), "bad-request");
    }

    /// Story: quota denials carry cap and current usage for the response body
    #[test]
    fn story_quota_exceeded_carries_numbers() {
        let err = Error::quota("GPU", 1, 1);
        match &err {
            Error::QuotaExceeded {
                resource,
                limit,
                current,
            } => {
                assert_eq!(resource, "GPU");
                assert_eq!(*limit, 1);
                assert_eq!(*current, 1);
            }
            _ => panic!("expected QuotaExceeded"),
        }
        assert!(err.to_string().contains("limit 1"));
    }

    /// Story: backend errors keep the upstream message verbatim
    #[test]
    fn story_backend_message_is_verbatim() {
        let upstream_msg = r#"1 error occurred: * Task group "usergroup" failed"#;
        let err = Error::backend("nomad", upstream_msg);
        assert!(err.to_string().contains(upstream_msg));
        assert_eq!(err.kind(), "backend-error");
    }

    #[test]
    fn test_retryability() {
        // Transient upstream failures retry (reads only)
        assert!(Error::backend("nomad", "connection reset").is_retryable());
        assert!(Error::timeout("catalog fetch").is_retryable());

        // User and logic errors never retry
        assert!(!Error::auth("expired").is_retryable());
        assert!(!Error::bad_request("f", "m").is_retryable());
        assert!(!Error::quota("GPU", 2, 2).is_retryable());
        assert!(!Error::forbidden("not yours").is_retryable());
        assert!(!Error::unknown_workload("module", "nope").is_retryable());
        assert!(!Error::internal("ctx", "boom").is_retryable());
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(Error::auth("x").kind(), "auth-failed");
        assert_eq!(Error::not_member("x").kind(), "not-member");
        assert_eq!(Error::unknown_workload("tool", "x").kind(), "unknown-workload");
        assert_eq!(Error::forbidden("x").kind(), "forbidden");
        assert_eq!(Error::timeout("x").kind(), "timeout");
        assert_eq!(Error::internal("c", "x").kind(), "internal-error");
    }

    #[test]
    fn test_unknown_workload_message() {
        let err = Error::unknown_workload("module", "demo-app");
        assert!(err.to_string().contains("module"));
        assert!(err.to_string().contains("demo-app"));
    }
}
