//! Probe failure causes and their operational classification

use std::fmt;

/// Result type alias for probe checks
pub type ProbeResult<T> = Result<T, ProbeError>;

/// A failure raised by a probe check.
///
/// Variants carry a human-readable detail string for logging. The variant
/// itself is what classification pattern-matches on, so probes must raise
/// the variant that describes the failing layer, not the outermost wrapper.
#[derive(Debug, Clone)]
pub enum ProbeError {
    /// The check exceeded its enforced time bound
    Timeout(String),

    /// Name resolution failed
    Dns(String),

    /// Certificate validation or TLS handshake failure
    Cert(String),

    /// SMTP authentication rejected or credentials refused
    Auth(String),

    /// Socket-level failure: refused, reset, unreachable, I/O error
    Network(String),

    /// The probe's own predicate did not hold
    CheckFailed(String),

    /// The circuit breaker is open and short-circuited the call
    CircuitOpen,

    /// Anything that fits no other variant
    Other(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Timeout(msg) => write!(f, "timed out: {}", msg),
            ProbeError::Dns(msg) => write!(f, "dns resolution failed: {}", msg),
            ProbeError::Cert(msg) => write!(f, "certificate validation failed: {}", msg),
            ProbeError::Auth(msg) => write!(f, "authentication rejected: {}", msg),
            ProbeError::Network(msg) => write!(f, "network error: {}", msg),
            ProbeError::CheckFailed(msg) => write!(f, "check failed: {}", msg),
            ProbeError::CircuitOpen => write!(f, "circuit breaker is open"),
            ProbeError::Other(msg) => write!(f, "probe error: {}", msg),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ProbeError::Timeout(err.to_string())
            }
            _ => ProbeError::Network(err.to_string()),
        }
    }
}

/// The closed set of categories used to label metrics and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCategory {
    Network,
    Dns,
    Auth,
    Cert,
    Timeout,
    CheckFailed,
    CircuitBreaker,
    Unknown,
}

impl ErrorCategory {
    /// Stable label value for the `error_type` metric dimension
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Dns => "dns",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Cert => "cert",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::CheckFailed => "check_failed",
            ErrorCategory::CircuitBreaker => "circuit_breaker",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a probe failure to its operational category.
///
/// With categorization disabled every cause is reported as `unknown`, which
/// collapses the `error_type` label to a single value for deployments that
/// do not want per-category cardinality.
pub fn classify(err: &ProbeError, categorization_enabled: bool) -> ErrorCategory {
    if !categorization_enabled {
        return ErrorCategory::Unknown;
    }

    match err {
        ProbeError::CircuitOpen => ErrorCategory::CircuitBreaker,
        ProbeError::Timeout(_) => ErrorCategory::Timeout,
        ProbeError::Dns(_) => ErrorCategory::Dns,
        ProbeError::Cert(_) => ErrorCategory::Cert,
        ProbeError::Auth(_) => ErrorCategory::Auth,
        ProbeError::Network(_) => ErrorCategory::Network,
        ProbeError::CheckFailed(_) => ErrorCategory::CheckFailed,
        ProbeError::Other(_) => ErrorCategory::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_cause_maps_to_its_category() {
        let cases = [
            (ProbeError::CircuitOpen, ErrorCategory::CircuitBreaker),
            (
                ProbeError::Timeout("deadline".into()),
                ErrorCategory::Timeout,
            ),
            (ProbeError::Dns("nxdomain".into()), ErrorCategory::Dns),
            (ProbeError::Cert("expired".into()), ErrorCategory::Cert),
            (ProbeError::Auth("535".into()), ErrorCategory::Auth),
            (
                ProbeError::Network("refused".into()),
                ErrorCategory::Network,
            ),
            (
                ProbeError::CheckFailed("no mx".into()),
                ErrorCategory::CheckFailed,
            ),
            (ProbeError::Other("???".into()), ErrorCategory::Unknown),
        ];

        for (err, expected) in cases {
            assert_eq!(classify(&err, true), expected, "cause: {err}");
        }
    }

    #[test]
    fn disabled_categorization_reports_unknown() {
        let causes = [
            ProbeError::CircuitOpen,
            ProbeError::Timeout("t".into()),
            ProbeError::Auth("535".into()),
            ProbeError::Network("refused".into()),
        ];

        for err in causes {
            assert_eq!(classify(&err, false), ErrorCategory::Unknown);
        }
    }

    #[test]
    fn io_timeout_converts_to_timeout_cause() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        assert!(matches!(ProbeError::from(err), ProbeError::Timeout(_)));

        let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(ProbeError::from(err), ProbeError::Network(_)));
    }
}
