//! Error taxonomy shared by every keeper component.
//!
//! Each `KeeperError` maps onto a small set of kinds. Pipeline stages and the
//! job coordinator decide per kind whether to retry, skip, or abort.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeeperError>;

/// Coarse classification used for retry and alerting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientRpc,
    EstimateRevert,
    TxRevert,
    InvariantViolation,
    NotFound,
    LockContention,
    Timeout,
    Validation,
    InsufficientFunds,
    DependencyUnmet,
    Database,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TransientRpc => "transient_rpc",
            ErrorKind::EstimateRevert => "estimate_revert",
            ErrorKind::TxRevert => "tx_revert",
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::DependencyUnmet => "dependency_unmet",
            ErrorKind::Database => "database",
            ErrorKind::Config => "config",
        };
        write!(f, "{}", s)
    }
}

#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("transient RPC failure: {0}")]
    TransientRpc(String),

    #[error("gas estimation reverted: {0}")]
    EstimateRevert(String),

    #[error("transaction reverted: {reason}")]
    TxRevert {
        reason: String,
        tx_hash: Option<String>,
    },

    #[error("transaction failed after {attempts} attempts: {last_error}")]
    TransactionFailed { attempts: u32, last_error: String },

    #[error("Cannot resolve cycle {cycle_id}: {missing} match(es) have NotSet results")]
    IncompleteResults { cycle_id: u64, missing: usize },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock for job {0} is held by another runner")]
    LockContention(String),

    #[error("job {job} exceeded its lock ttl")]
    Timeout { job: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("insufficient funds: need {needed} wei, signer has {available} wei")]
    InsufficientFunds { needed: String, available: String },

    #[error("dependency {dependency} of job {job} not satisfied")]
    DependencyUnmet { job: String, dependency: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl KeeperError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeeperError::TransientRpc(_) => ErrorKind::TransientRpc,
            KeeperError::TransactionFailed { .. } => ErrorKind::TransientRpc,
            KeeperError::EstimateRevert(_) => ErrorKind::EstimateRevert,
            KeeperError::TxRevert { .. } => ErrorKind::TxRevert,
            KeeperError::IncompleteResults { .. } => ErrorKind::InvariantViolation,
            KeeperError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            KeeperError::NotFound(_) => ErrorKind::NotFound,
            KeeperError::LockContention(_) => ErrorKind::LockContention,
            KeeperError::Timeout { .. } => ErrorKind::Timeout,
            KeeperError::Validation(_) => ErrorKind::Validation,
            KeeperError::Serialization(_) => ErrorKind::Validation,
            KeeperError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            KeeperError::DependencyUnmet { .. } => ErrorKind::DependencyUnmet,
            KeeperError::Database(_) => ErrorKind::Database,
            KeeperError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the coordinator may schedule another attempt of the job.
    ///
    /// Reverts are retriable unless they match a known terminal revert
    /// string; callers that classify reverts themselves convert terminal ones
    /// into non-error outcomes before they reach the coordinator.
    pub fn is_retriable(&self) -> bool {
        match self.kind() {
            ErrorKind::TransientRpc
            | ErrorKind::EstimateRevert
            | ErrorKind::TxRevert
            | ErrorKind::LockContention
            | ErrorKind::Database
            | ErrorKind::Timeout => true,
            ErrorKind::InvariantViolation
            | ErrorKind::NotFound
            | ErrorKind::Validation
            | ErrorKind::InsufficientFunds
            | ErrorKind::DependencyUnmet
            | ErrorKind::Config => false,
        }
    }

    /// Errors that must reach `oracle.system_alerts` in addition to the
    /// execution log.
    pub fn needs_alert(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvariantViolation | ErrorKind::TxRevert | ErrorKind::InsufficientFunds
        )
    }

    /// Map a sqlx error, turning trigger/CHECK rejections into validation
    /// errors and foreign-key misses into `NotFound`.
    pub fn from_db(e: sqlx::Error) -> Self {
        if let Some(db_err) = e.as_database_error() {
            match db_err.code().as_deref() {
                Some("23514") => return KeeperError::Validation(db_err.message().to_string()),
                Some("23503") => return KeeperError::NotFound(db_err.message().to_string()),
                _ => {}
            }
        }
        KeeperError::Database(e)
    }

    /// Classify an RPC/provider error by its message.
    pub fn from_rpc(err: impl std::fmt::Display) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("execution reverted") || lower.contains("revert") {
            return KeeperError::TxRevert {
                reason: extract_revert_reason(&msg),
                tx_hash: None,
            };
        }
        if lower.contains("insufficient funds") {
            return KeeperError::InsufficientFunds {
                needed: "unknown".to_string(),
                available: "unknown".to_string(),
            };
        }
        KeeperError::TransientRpc(msg)
    }
}

/// Pull the human-readable revert string out of a provider error message.
///
/// Providers format these as `execution reverted: <reason>` or
/// `execution reverted: revert: <reason>`; anything else is returned whole.
pub fn extract_revert_reason(msg: &str) -> String {
    let lower = msg.to_lowercase();
    if let Some(pos) = lower.rfind("revert:") {
        let reason = msg[pos + "revert:".len()..].trim();
        let reason = reason.split(['\n', ',']).next().unwrap_or(reason);
        return reason.trim_matches(|c: char| c == '"' || c.is_whitespace()).to_string();
    }
    if let Some(pos) = lower.find("execution reverted:") {
        return msg[pos + "execution reverted:".len()..].trim().to_string();
    }
    msg.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_results_message() {
        let err = KeeperError::IncompleteResults { cycle_id: 12, missing: 1 };
        assert_eq!(
            err.to_string(),
            "Cannot resolve cycle 12: 1 match(es) have NotSet results"
        );
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        assert!(!err.is_retriable());
        assert!(err.needs_alert());
    }

    #[test]
    fn test_rpc_classification() {
        let err = KeeperError::from_rpc("server returned an error response: error code 3: execution reverted: Event not ended yet");
        match err {
            KeeperError::TxRevert { reason, .. } => assert_eq!(reason, "Event not ended yet"),
            other => panic!("unexpected {other:?}"),
        }

        let err = KeeperError::from_rpc("HTTP error 503 with body: upstream connect error");
        assert_eq!(err.kind(), ErrorKind::TransientRpc);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_revert_reason_extraction() {
        assert_eq!(
            extract_revert_reason("execution reverted: revert: Already settled"),
            "Already settled"
        );
        assert_eq!(extract_revert_reason("something odd"), "something odd");
    }
}
