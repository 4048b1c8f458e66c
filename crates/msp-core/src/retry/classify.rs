//! Classify operation failures into the closed error taxonomy.
//!
//! Classification is a prioritised table walk over the lower-cased error text:
//! the first rule with a matching phrase or status code wins. Typed sources
//! (`std::io::Error`, tokio timeouts) are checked before the text.

use serde::Serialize;
use std::fmt;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCategory {
    Throttling,
    Timeout,
    Authorization,
    NotFound,
    Network,
    TenantConfig,
    QuotaExceeded,
    ServiceUnavailable,
    InvalidRequest,
    Conflict,
    Certificate,
    /// Anything no rule matched. Retried so unknown transient failures get a bounded number of attempts.
    General,
}

/// How loudly a failure should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Throttling
                | ErrorCategory::Timeout
                | ErrorCategory::Network
                | ErrorCategory::ServiceUnavailable
                | ErrorCategory::Certificate
                | ErrorCategory::General
        )
    }

    /// Backoff multiplier; 1.0 for categories that are never retried.
    pub fn backoff_multiplier(self) -> f64 {
        match self {
            ErrorCategory::Throttling | ErrorCategory::ServiceUnavailable => 3.0,
            ErrorCategory::Timeout => 1.5,
            ErrorCategory::Network => 1.2,
            _ => 1.0,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorCategory::Throttling | ErrorCategory::Conflict => Severity::Low,
            ErrorCategory::Authorization
            | ErrorCategory::TenantConfig
            | ErrorCategory::QuotaExceeded
            | ErrorCategory::ServiceUnavailable
            | ErrorCategory::Certificate => Severity::High,
            ErrorCategory::Timeout
            | ErrorCategory::NotFound
            | ErrorCategory::Network
            | ErrorCategory::InvalidRequest
            | ErrorCategory::General => Severity::Medium,
        }
    }

    /// Full classification for this category.
    pub fn classification(self) -> ErrorClassification {
        ErrorClassification {
            category: self,
            retryable: self.is_retryable(),
            backoff_multiplier: self.backoff_multiplier(),
            severity: self.severity(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Verdict for one failed attempt. Recomputed from the raw error every time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub retryable: bool,
    /// Always >= 1.0.
    pub backoff_multiplier: f64,
    pub severity: Severity,
}

impl ErrorClassification {
    /// Same category and severity, but never retried (critical operations).
    pub fn non_retryable(self) -> Self {
        Self {
            retryable: false,
            ..self
        }
    }
}

struct Rule {
    category: ErrorCategory,
    phrases: &'static [&'static str],
    codes: &'static [u16],
}

/// Ordered; first match wins.
const RULES: &[Rule] = &[
    Rule {
        category: ErrorCategory::Throttling,
        phrases: &["throttl", "rate limit"],
        codes: &[429],
    },
    Rule {
        category: ErrorCategory::Timeout,
        phrases: &["timeout", "timed out"],
        codes: &[],
    },
    Rule {
        category: ErrorCategory::Authorization,
        phrases: &["unauthorized", "forbidden"],
        codes: &[401, 403],
    },
    Rule {
        category: ErrorCategory::NotFound,
        phrases: &["not found"],
        codes: &[404],
    },
    Rule {
        category: ErrorCategory::Network,
        phrases: &["network", "connection", "dns"],
        codes: &[],
    },
    Rule {
        category: ErrorCategory::TenantConfig,
        phrases: &["tenant", "subscription", "license"],
        codes: &[],
    },
    Rule {
        category: ErrorCategory::QuotaExceeded,
        phrases: &["quota", "storage", "limit exceeded"],
        codes: &[],
    },
    Rule {
        category: ErrorCategory::ServiceUnavailable,
        phrases: &["service unavailable"],
        codes: &[503, 502, 500],
    },
    Rule {
        category: ErrorCategory::InvalidRequest,
        phrases: &["invalid", "bad request"],
        codes: &[400],
    },
    Rule {
        category: ErrorCategory::Conflict,
        phrases: &["conflict", "already exists"],
        codes: &[409],
    },
    Rule {
        category: ErrorCategory::Certificate,
        phrases: &["certificate", "ssl", "tls"],
        codes: &[],
    },
];

/// True if `code` appears in `text` without a digit directly before or after it.
fn contains_code(text: &str, code: u16) -> bool {
    let needle = code.to_string();
    let bytes = text.as_bytes();
    text.match_indices(&needle).any(|(start, m)| {
        let end = start + m.len();
        let before_ok = start == 0 || !bytes[start - 1].is_ascii_digit();
        let after_ok = end >= bytes.len() || !bytes[end].is_ascii_digit();
        before_ok && after_ok
    })
}

fn category_for_text(text: &str) -> ErrorCategory {
    let lower = text.to_lowercase();
    RULES
        .iter()
        .find(|rule| {
            rule.phrases.iter().any(|p| lower.contains(p))
                || rule.codes.iter().any(|c| contains_code(&lower, *c))
        })
        .map(|rule| rule.category)
        .unwrap_or(ErrorCategory::General)
}

/// Classify a raw error message. Total: empty or unmatched text is `General`.
pub fn classify_message(message: &str) -> ErrorClassification {
    category_for_text(message).classification()
}

/// Classify an HTTP status code using the same table as messages.
pub fn classify_http_status(code: u16) -> ErrorClassification {
    RULES
        .iter()
        .find(|rule| rule.codes.contains(&code))
        .map(|rule| rule.category)
        .unwrap_or(ErrorCategory::General)
        .classification()
}

fn category_for_io(e: &std::io::Error) -> Option<ErrorCategory> {
    use std::io::ErrorKind as K;
    match e.kind() {
        K::TimedOut => Some(ErrorCategory::Timeout),
        K::ConnectionRefused
        | K::ConnectionReset
        | K::ConnectionAborted
        | K::NotConnected
        | K::BrokenPipe => Some(ErrorCategory::Network),
        _ => None,
    }
}

/// Classify any error: typed sources in the chain first, then the full rendered chain text.
pub fn classify_error(err: &anyhow::Error) -> ErrorClassification {
    for cause in err.chain() {
        if cause.is::<tokio::time::error::Elapsed>() {
            return ErrorCategory::Timeout.classification();
        }
        if let Some(category) = cause
            .downcast_ref::<std::io::Error>()
            .and_then(category_for_io)
        {
            return category.classification();
        }
    }
    classify_message(&format!("{:#}", err))
}
