//! RPC status codes and the mapping to and from HTTP status codes.

use bytes::Bytes;
use std::fmt;

/// RPC status codes (different from HTTP status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Invalid argument was provided.
    InvalidArgument = 3,
    /// Deadline expired before operation could complete.
    DeadlineExceeded = 4,
    /// Requested entity was not found.
    NotFound = 5,
    /// Entity already exists.
    AlreadyExists = 6,
    /// Permission denied.
    PermissionDenied = 7,
    /// Resource has been exhausted.
    ResourceExhausted = 8,
    /// Operation was rejected because the system is not in a state required for execution.
    FailedPrecondition = 9,
    /// Operation was aborted.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Operation is not implemented or supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// Service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// Request does not have valid authentication credentials.
    Unauthenticated = 16,
}

const ALL_CODES: [Code; 17] = [
    Code::Ok,
    Code::Cancelled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

impl Code {
    /// Create a Code from its numeric value, mapping unknown values to
    /// `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        Self::try_from_u32(value).unwrap_or(Code::Unknown)
    }

    /// Create a Code from its numeric value.
    pub fn try_from_u32(value: u32) -> Option<Self> {
        ALL_CODES.get(value as usize).copied()
    }

    /// Get the numeric value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Check if this is a successful status.
    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }

    /// Lowercase snake_case name, as used by JSON error bodies.
    pub fn name(self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::Cancelled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    /// Parse a snake_case name. Both spellings of cancelled are accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        if name == "cancelled" {
            return Some(Code::Cancelled);
        }
        ALL_CODES.iter().copied().find(|code| code.name() == name)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        write!(f, "{}", name)
    }
}

/// Map an HTTP status to an RPC code.
///
/// Only used when a response carries no explicit protocol status. A bare
/// 200 maps to `Unknown`: a successful HTTP exchange without a protocol
/// status is itself an anomaly.
pub fn code_from_http_status(status: u16) -> Code {
    match status {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Map an RPC code to the HTTP status used for Triple unary errors.
pub fn http_status_from_code(code: Code) -> u16 {
    match code {
        Code::Ok => 200,
        Code::Cancelled => 499,
        Code::Unknown => 500,
        Code::InvalidArgument => 400,
        Code::DeadlineExceeded => 504,
        Code::NotFound => 404,
        Code::AlreadyExists => 409,
        Code::PermissionDenied => 403,
        Code::ResourceExhausted => 429,
        Code::FailedPrecondition => 400,
        Code::Aborted => 409,
        Code::OutOfRange => 400,
        Code::Unimplemented => 501,
        Code::Internal => 500,
        Code::Unavailable => 503,
        Code::DataLoss => 500,
        Code::Unauthenticated => 401,
    }
}

/// A structured error detail: a type name and its serialized value.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDetail {
    /// Fully qualified type name of the detail message.
    pub type_name: String,
    /// Serialized detail message.
    pub value: Bytes,
    /// Optional human-readable rendering of the value.
    pub debug: Option<serde_json::Value>,
}

impl ErrorDetail {
    pub fn new(type_name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            type_name: type_name.into(),
            value: value.into(),
            debug: None,
        }
    }
}

/// Status returned from an RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// The status code.
    code: Code,
    /// Optional human-readable message.
    message: Option<String>,
    /// Structured error details.
    details: Vec<ErrorDetail>,
}

impl Status {
    /// Create a new status.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            details: Vec::new(),
        }
    }

    /// Create an OK status.
    pub fn ok() -> Self {
        Self::from_code(Code::Ok)
    }

    /// Create a status from just a code.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
            details: Vec::new(),
        }
    }

    /// Attach a structured detail.
    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    /// Get the status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the status message, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Get the structured details.
    pub fn details(&self) -> &[ErrorDetail] {
        &self.details
    }

    /// Check if this is a successful status.
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Create a cancelled status.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    /// Create an unknown error status.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    /// Create an invalid argument status.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// Create a deadline exceeded status.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    /// Create a not found status.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// Create a resource exhausted status.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    /// Create an unimplemented status.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    /// Create an internal error status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Create an unavailable status.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// Create an unauthenticated status.
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    /// Status derived from an HTTP response that carried no protocol status.
    pub fn from_http_status(status: u16) -> Self {
        Self::new(code_from_http_status(status), format!("HTTP {status}"))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for i in 0..=16 {
            let code = Code::from_u32(i);
            assert_eq!(code.as_u32(), i);
        }
    }

    #[test]
    fn test_code_from_u32_unknown() {
        assert_eq!(Code::from_u32(17), Code::Unknown);
        assert_eq!(Code::from_u32(u32::MAX), Code::Unknown);
        assert_eq!(Code::try_from_u32(17), None);
    }

    #[test]
    fn test_code_names() {
        for code in ALL_CODES {
            assert_eq!(Code::from_name(code.name()), Some(code));
        }
        assert_eq!(Code::from_name("cancelled"), Some(Code::Cancelled));
        assert_eq!(Code::from_name("NOT_FOUND"), None);
    }

    #[test]
    fn test_code_display() {
        assert_eq!(format!("{}", Code::Ok), "OK");
        assert_eq!(format!("{}", Code::DeadlineExceeded), "DEADLINE_EXCEEDED");
        assert_eq!(format!("{}", Code::Unauthenticated), "UNAUTHENTICATED");
    }

    #[test]
    fn test_code_from_http_status_table() {
        assert_eq!(code_from_http_status(400), Code::Internal);
        assert_eq!(code_from_http_status(401), Code::Unauthenticated);
        assert_eq!(code_from_http_status(403), Code::PermissionDenied);
        assert_eq!(code_from_http_status(404), Code::Unimplemented);
        assert_eq!(code_from_http_status(429), Code::Unavailable);
        assert_eq!(code_from_http_status(502), Code::Unavailable);
        assert_eq!(code_from_http_status(503), Code::Unavailable);
        assert_eq!(code_from_http_status(504), Code::Unavailable);
    }

    #[test]
    fn test_code_from_http_status_defaults_to_unknown() {
        assert_eq!(code_from_http_status(200), Code::Unknown);
        assert_eq!(code_from_http_status(418), Code::Unknown);
        assert_eq!(code_from_http_status(500), Code::Unknown);
        assert_eq!(code_from_http_status(0), Code::Unknown);
        assert_eq!(code_from_http_status(u16::MAX), Code::Unknown);
    }

    #[test]
    fn test_http_status_from_code() {
        assert_eq!(http_status_from_code(Code::Ok), 200);
        assert_eq!(http_status_from_code(Code::Unimplemented), 501);
        assert_eq!(http_status_from_code(Code::InvalidArgument), 400);
        assert_eq!(http_status_from_code(Code::DeadlineExceeded), 504);
        assert_eq!(http_status_from_code(Code::Unavailable), 503);
    }

    #[test]
    fn test_status_ok() {
        let status = Status::ok();
        assert!(status.is_ok());
        assert!(status.message().is_none());
        assert!(status.details().is_empty());
    }

    #[test]
    fn test_status_with_message() {
        let status = Status::not_found("key does not exist");
        assert!(!status.is_ok());
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), Some("key does not exist"));
    }

    #[test]
    fn test_status_with_detail() {
        let status = Status::invalid_argument("bad")
            .with_detail(ErrorDetail::new("example.Field", Bytes::from_static(b"\x0a\x01x")));
        assert_eq!(status.details().len(), 1);
        assert_eq!(status.details()[0].type_name, "example.Field");
    }

    #[test]
    fn test_status_from_http_status() {
        let status = Status::from_http_status(503);
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), Some("HTTP 503"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", Status::from_code(Code::Ok)), "OK");
        assert_eq!(
            format!("{}", Status::not_found("entity not found")),
            "NOT_FOUND: entity not found"
        );
    }

    #[test]
    fn test_status_is_error() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<Status>();
    }
}
