//! Error classification.
//!
//! `classify` is a pure mapping from a raw [`AegisError`] plus its call
//! context to a normalized [`ErrorRecord`]: taxonomy kind, severity,
//! recoverability, a user-safe message, and a stable fingerprint used to
//! collapse repeated occurrences. Raw error text is only attached when the
//! `AEGIS_DEV_ERRORS` environment gate is set; `user_message` never contains
//! internal detail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AegisError;

/// Taxonomy of failure causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Validation,
    Auth,
    Processing,
    System,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::Processing => "processing",
            ErrorKind::System => "system",
        };
        write!(f, "{}", name)
    }
}

/// Impact of a failure; `Critical` forces full-screen disclosure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// Caller's declared experience tier; shapes disclosure content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceTier {
    #[default]
    New,
    Intermediate,
    Power,
}

/// Context describing the guarded call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallContext {
    /// Logical operation name, e.g. "upload-image".
    pub operation: String,
    /// Device/user-agent hint, if the caller has one.
    pub device: Option<String>,
    pub experience_tier: ExperienceTier,
}

impl CallContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            device: None,
            experience_tier: ExperienceTier::default(),
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_tier(mut self, tier: ExperienceTier) -> Self {
        self.experience_tier = tier;
        self
    }
}

/// Normalized record of a terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub recoverable: bool,
    /// Name of the external dependency the call was guarded against.
    pub dependency: Option<String>,
    /// Internal description, safe to log.
    pub message: String,
    /// User-facing message; never contains raw error text.
    pub user_message: String,
    pub prevention_tip: Option<String>,
    /// Raw error text, populated only behind the developer gate.
    pub developer_detail: Option<String>,
    pub context: CallContext,
    /// Stable identity (kind + dependency + operation) used to collapse
    /// repeated notifications.
    pub fingerprint: String,
    /// Occurrences of this fingerprint inside the observation window; set
    /// by the disclosure controller.
    pub occurrence_count: u32,
}

/// Stable identity for deduplicating repeated errors.
pub fn fingerprint(kind: ErrorKind, dependency: Option<&str>, operation: &str) -> String {
    format!("{}:{}:{}", kind, dependency.unwrap_or("-"), operation)
}

fn dev_errors_enabled() -> bool {
    std::env::var("AEGIS_DEV_ERRORS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

struct Classification {
    kind: ErrorKind,
    severity: Severity,
    recoverable: bool,
    user_message: &'static str,
    prevention_tip: Option<&'static str>,
}

fn classification_for(error: &AegisError) -> Classification {
    match error {
        AegisError::NetworkError(_) | AegisError::Timeout { .. } => Classification {
            kind: ErrorKind::Network,
            severity: Severity::Medium,
            recoverable: true,
            user_message: "We're having trouble reaching the server. Please check your connection.",
            prevention_tip: Some("Spotty connections recover on their own; your work is kept safe."),
        },
        AegisError::CircuitOpen { .. } => Classification {
            kind: ErrorKind::Network,
            severity: Severity::Medium,
            recoverable: true,
            user_message: "This service is taking a short break to recover. Please try again in a moment.",
            prevention_tip: None,
        },
        AegisError::HttpStatus { status, .. } => match status {
            402 => Classification {
                kind: ErrorKind::Processing,
                severity: Severity::Critical,
                recoverable: false,
                user_message: "Your payment could not be completed. No charge was made.",
                prevention_tip: Some("Check your payment details before trying again."),
            },
            400 | 422 => Classification {
                kind: ErrorKind::Validation,
                severity: Severity::Low,
                recoverable: false,
                user_message: "Some of the provided details look invalid. Please review and try again.",
                prevention_tip: Some("Double-check required fields before submitting."),
            },
            401 | 403 => Classification {
                kind: ErrorKind::Auth,
                severity: Severity::Medium,
                recoverable: false,
                user_message: "Your session has expired. Please sign in again.",
                prevention_tip: None,
            },
            408 | 429 => Classification {
                kind: ErrorKind::Network,
                severity: Severity::Medium,
                recoverable: true,
                user_message: "The server is busy right now. We'll retry shortly.",
                prevention_tip: None,
            },
            500..=599 => Classification {
                kind: ErrorKind::Processing,
                severity: Severity::High,
                recoverable: true,
                user_message: "The server hit a problem processing your request. We'll retry shortly.",
                prevention_tip: None,
            },
            _ => Classification {
                kind: ErrorKind::System,
                severity: Severity::High,
                recoverable: false,
                user_message: "Something unexpected went wrong. Please try again.",
                prevention_tip: None,
            },
        },
        AegisError::Validation { .. } => Classification {
            kind: ErrorKind::Validation,
            severity: Severity::Low,
            recoverable: false,
            user_message: "Some of the provided details look invalid. Please review and try again.",
            prevention_tip: Some("Double-check required fields before submitting."),
        },
        AegisError::Auth { .. } => Classification {
            kind: ErrorKind::Auth,
            severity: Severity::Medium,
            recoverable: false,
            user_message: "Your session has expired. Please sign in again.",
            prevention_tip: None,
        },
        AegisError::Processing { .. } => Classification {
            kind: ErrorKind::Processing,
            severity: Severity::High,
            recoverable: true,
            user_message: "Processing failed. We'll retry shortly.",
            prevention_tip: None,
        },
        AegisError::OperationLocked { .. } => Classification {
            kind: ErrorKind::Processing,
            severity: Severity::Critical,
            recoverable: false,
            user_message: "This action is paused after a serious error. Please review it before retrying.",
            prevention_tip: None,
        },
        AegisError::Storage { .. } | AegisError::IoError(_) => Classification {
            kind: ErrorKind::System,
            severity: Severity::High,
            recoverable: false,
            user_message: "We couldn't save data on this device. Free up space or try another browser mode.",
            prevention_tip: Some("Private browsing can limit local storage."),
        },
        // Unknown signatures default to an opaque system failure.
        AegisError::ConfigError(_)
        | AegisError::Cancelled { .. }
        | AegisError::Internal { .. }
        | AegisError::JsonError(_) => Classification {
            kind: ErrorKind::System,
            severity: Severity::High,
            recoverable: false,
            user_message: "Something unexpected went wrong. Please try again.",
            prevention_tip: None,
        },
    }
}

/// Map a raw error and its call context to a normalized record.
///
/// Deterministic and side-effect free; `occurrence_count` starts at 1 and is
/// adjusted by the disclosure controller when the record is presented.
pub fn classify(
    error: &AegisError,
    dependency: Option<&str>,
    context: &CallContext,
) -> ErrorRecord {
    let classification = classification_for(error);
    let message = error.to_string();

    ErrorRecord {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        kind: classification.kind,
        severity: classification.severity,
        recoverable: classification.recoverable,
        dependency: dependency.map(|d| d.to_string()),
        user_message: classification.user_message.to_string(),
        prevention_tip: classification.prevention_tip.map(|t| t.to_string()),
        developer_detail: dev_errors_enabled().then(|| message.clone()),
        message,
        fingerprint: fingerprint(classification.kind, dependency, &context.operation),
        context: context.clone(),
        occurrence_count: 1,
    }
}
