//! Failure classification and per-file failure bookkeeping.
//!
//! Every transport error passes through [`classify`] before anything else
//! looks at it. The resulting [`ErrorType`] drives two decisions: whether a
//! cached temporary URL must be discarded ([`should_refresh_url`]) and how
//! failures are grouped in the final report.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    Network,
    Cors,
    Auth,
    ExpiredUrl,
    Client,
    Server,
    Filesystem,
    Websocket,
    Unknown,
}

impl ErrorType {
    /// Stable snake_case label used in logs and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Cors => "cors",
            Self::Auth => "auth",
            Self::ExpiredUrl => "expired_url",
            Self::Client => "client",
            Self::Server => "server",
            Self::Filesystem => "filesystem",
            Self::Websocket => "websocket",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport-level error as seen by the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferError {
    /// HTTP status, if the failure came from a response.
    pub status: Option<u16>,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable code such as `ETIMEDOUT` or `ECONNREFUSED`.
    pub code: Option<String>,
}

impl TransferError {
    /// Creates an error carrying only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            code: None,
        }
    }

    /// Creates an error for an HTTP status.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            code: None,
        }
    }

    /// Attaches a machine-readable code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// A received body whose length disagrees with the declared size.
    #[must_use]
    pub fn size_mismatch(expected: u64, received: u64) -> Self {
        Self::new(format!(
            "size mismatch: expected {expected} bytes, received {received}"
        ))
        .with_code(SIZE_MISMATCH_CODE)
    }

    /// Returns true if this error came from the integrity check.
    #[must_use]
    pub fn is_size_mismatch(&self) -> bool {
        self.code.as_deref() == Some(SIZE_MISMATCH_CODE)
    }
}

const SIZE_MISMATCH_CODE: &str = "ESIZEMISMATCH";

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) if self.message.is_empty() => write!(f, "HTTP {status}"),
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        let mut out = Self::new(err.to_string());
        out.status = err.status().map(|s| s.as_u16());
        if err.is_timeout() {
            out.code = Some("ETIMEDOUT".into());
        } else if err.is_connect() {
            out.code = Some("ECONNREFUSED".into());
        }
        out
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::TimedOut => "ETIMEDOUT",
            ErrorKind::ConnectionRefused => "ECONNREFUSED",
            ErrorKind::ConnectionReset => "ECONNRESET",
            ErrorKind::ConnectionAborted => "ECONNABORTED",
            _ => "EIO",
        };
        let message = if code == "EIO" {
            format!("filesystem error: {err}")
        } else {
            err.to_string()
        };
        Self::new(message).with_code(code)
    }
}

const TIMEOUT_CODES: &[&str] = &["ECONNABORTED", "ETIMEDOUT"];
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "aborted"];
const NETWORK_CODES: &[&str] = &["ENOTFOUND", "ECONNREFUSED", "ECONNRESET", "EAI_AGAIN"];
const NETWORK_MARKERS: &[&str] = &[
    "network error",
    "failed to fetch",
    "dns",
    "connection refused",
    "connection reset",
    "name resolution",
];
const CORS_MARKERS: &[&str] = &["cors", "cross-origin", "access-control-allow-origin"];
const FILESYSTEM_MARKERS: &[&str] = &[
    "filesystem",
    "disk",
    "quota",
    "no space",
    "read-only file system",
    "permission denied",
];

/// Maps a transport error to the failure taxonomy.
///
/// Checks run in a fixed priority order, so the result depends only on the
/// error's status, message and code.
#[must_use]
pub fn classify(err: &TransferError) -> ErrorType {
    let message = err.message.to_lowercase();
    let code = err.code.as_deref().unwrap_or("");
    let has = |markers: &[&str]| markers.iter().any(|m| message.contains(m));

    if TIMEOUT_CODES.contains(&code) || has(TIMEOUT_MARKERS) {
        return ErrorType::Timeout;
    }
    if NETWORK_CODES.contains(&code) || has(NETWORK_MARKERS) {
        return ErrorType::Network;
    }
    if has(CORS_MARKERS) {
        return ErrorType::Cors;
    }
    if let Some(status) = err.status {
        match status {
            401 | 403 => return ErrorType::Auth,
            400 | 404 | 410 => return ErrorType::ExpiredUrl,
            402..=499 => return ErrorType::Client,
            500..=599 => return ErrorType::Server,
            _ => {}
        }
    }
    if code == "EIO" || has(FILESYSTEM_MARKERS) {
        return ErrorType::Filesystem;
    }
    ErrorType::Unknown
}

/// Returns true if a cached temporary URL must be discarded and re-minted.
#[must_use]
pub fn should_refresh_url(error_type: ErrorType, status: Option<u16>) -> bool {
    error_type == ErrorType::ExpiredUrl || matches!(status, Some(400 | 401 | 403 | 404 | 410))
}

/// One recorded failure, keyed by the file's `order`.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    /// Correlation key of the file.
    pub order: u32,
    /// The last error observed.
    pub error: TransferError,
    /// Classified type of `error`.
    pub error_type: ErrorType,
    /// Attempts spent before giving up.
    pub retry_count: u32,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Per-job failure map.
#[derive(Debug, Default)]
pub struct FailureRecorder {
    records: HashMap<u32, FailureRecord>,
}

impl FailureRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or replaces) the failure for `order` and returns its type.
    pub fn record_failure(&mut self, order: u32, error: TransferError, retry_count: u32) -> ErrorType {
        let error_type = classify(&error);
        self.insert(order, error, error_type, retry_count);
        error_type
    }

    /// Records a failure whose type is already known (e.g. agent-side
    /// protocol failures).
    pub fn insert(&mut self, order: u32, error: TransferError, error_type: ErrorType, retry_count: u32) {
        self.records.insert(
            order,
            FailureRecord {
                order,
                error,
                error_type,
                retry_count,
                timestamp: Utc::now(),
            },
        );
    }

    /// Removes the record for `order` after a successful retry.
    pub fn resolve(&mut self, order: u32) -> Option<FailureRecord> {
        self.records.remove(&order)
    }

    /// Returns the record for `order`, if any.
    #[must_use]
    pub fn get(&self, order: u32) -> Option<&FailureRecord> {
        self.records.get(&order)
    }

    /// Number of files currently failed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing has failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Orders of all failed files, ascending.
    #[must_use]
    pub fn orders(&self) -> Vec<u32> {
        let mut orders: Vec<u32> = self.records.keys().copied().collect();
        orders.sort_unstable();
        orders
    }

    /// Failure counts grouped by type.
    #[must_use]
    pub fn counts_by_type(&self) -> BTreeMap<ErrorType, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records.values() {
            *counts.entry(record.error_type).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_priority_order() {
        // Timeout wins over a status that would otherwise mean "server".
        let err = TransferError::http(504, "gateway timeout");
        assert_eq!(classify(&err), ErrorType::Timeout);

        let err = TransferError::new("request failed").with_code("ECONNREFUSED");
        assert_eq!(classify(&err), ErrorType::Network);

        let err = TransferError::new("blocked by CORS policy");
        assert_eq!(classify(&err), ErrorType::Cors);
    }

    #[test]
    fn classify_http_statuses() {
        assert_eq!(classify(&TransferError::http(401, "")), ErrorType::Auth);
        assert_eq!(classify(&TransferError::http(403, "")), ErrorType::Auth);
        assert_eq!(classify(&TransferError::http(400, "")), ErrorType::ExpiredUrl);
        assert_eq!(classify(&TransferError::http(404, "")), ErrorType::ExpiredUrl);
        assert_eq!(classify(&TransferError::http(410, "")), ErrorType::ExpiredUrl);
        assert_eq!(classify(&TransferError::http(429, "")), ErrorType::Client);
        assert_eq!(classify(&TransferError::http(500, "")), ErrorType::Server);
        assert_eq!(classify(&TransferError::http(503, "")), ErrorType::Server);
    }

    #[test]
    fn classify_filesystem_and_unknown() {
        let io = std::io::Error::other("no space left on device");
        assert_eq!(classify(&TransferError::from(io)), ErrorType::Filesystem);
        assert_eq!(classify(&TransferError::new("disk quota exceeded")), ErrorType::Filesystem);
        assert_eq!(classify(&TransferError::new("something odd")), ErrorType::Unknown);
    }

    #[test]
    fn io_timeout_maps_to_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(classify(&TransferError::from(io)), ErrorType::Timeout);
    }

    #[test]
    fn refresh_only_for_expiry_statuses() {
        assert!(should_refresh_url(ErrorType::ExpiredUrl, None));
        for status in [400, 401, 403, 404, 410] {
            assert!(should_refresh_url(ErrorType::Unknown, Some(status)));
        }
        assert!(!should_refresh_url(ErrorType::Server, Some(500)));
        assert!(!should_refresh_url(ErrorType::Client, Some(429)));
        assert!(!should_refresh_url(ErrorType::Timeout, None));
    }

    #[test]
    fn recorder_last_write_wins_and_resolves() {
        let mut recorder = FailureRecorder::new();
        recorder.record_failure(7, TransferError::http(500, "boom"), 3);
        recorder.record_failure(7, TransferError::http(404, "gone"), 3);
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.get(7).unwrap().error_type, ErrorType::ExpiredUrl);

        assert!(recorder.resolve(7).is_some());
        assert!(recorder.is_empty());
        assert!(recorder.resolve(7).is_none());
    }

    #[test]
    fn recorder_counts_by_type() {
        let mut recorder = FailureRecorder::new();
        recorder.record_failure(1, TransferError::http(500, ""), 3);
        recorder.record_failure(2, TransferError::http(502, ""), 3);
        recorder.record_failure(3, TransferError::new("timed out"), 3);
        let counts = recorder.counts_by_type();
        assert_eq!(counts.get(&ErrorType::Server), Some(&2));
        assert_eq!(counts.get(&ErrorType::Timeout), Some(&1));
        assert_eq!(recorder.orders(), vec![1, 2, 3]);
    }

    #[test]
    fn display_formats() {
        assert_eq!(TransferError::http(404, "").to_string(), "HTTP 404");
        assert_eq!(TransferError::http(500, "oops").to_string(), "HTTP 500: oops");
        assert_eq!(TransferError::new("plain").to_string(), "plain");
        assert!(TransferError::size_mismatch(10, 5).is_size_mismatch());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn classify_is_pure(
                status in proptest::option::of(100u16..600),
                message in ".{0,40}",
                code in proptest::option::of("[A-Z]{0,12}"),
            ) {
                let err = TransferError { status, message, code };
                prop_assert_eq!(classify(&err), classify(&err.clone()));
            }

            #[test]
            fn refresh_iff_expired_or_listed_status(status in proptest::option::of(100u16..600)) {
                let err = TransferError { status, message: String::new(), code: None };
                let ty = classify(&err);
                let expected = ty == ErrorType::ExpiredUrl
                    || matches!(status, Some(400 | 401 | 403 | 404 | 410));
                prop_assert_eq!(should_refresh_url(ty, status), expected);
            }
        }
    }
}
