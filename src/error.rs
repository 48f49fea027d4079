use bytes::Bytes;
use thiserror::Error;

/// Numeric error codes as they appear in REQUEST_ERROR / SOFTNET_ERROR messages
pub mod error_code {
    pub const UNEXPECTED_ERROR: i32 = 63;
    pub const CLIENT_OFFLINE: i32 = 105;
    pub const ACCESS_DENIED: i32 = 112;
    pub const SERVICE_OFFLINE: i32 = 115;
    pub const SERVICE_BUSY: i32 = 116;
    pub const PORT_UNREACHABLE: i32 = 121;
    pub const CONNECTION_ATTEMPT_FAILED: i32 = 122;
    pub const MISSING_PROCEDURE: i32 = 132;
    pub const ARGUMENT_ERROR: i32 = 133;
    pub const TIMEOUT_EXPIRED: i32 = 250;
}

/// The outcome of a failed connect or call request, as seen by the application
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("the remote service is offline")]
    ServiceOffline,
    #[error("the client endpoint is offline")]
    ClientOffline,
    #[error("virtual port {0} is unreachable")]
    PortUnreachable(i32),
    #[error("access denied")]
    AccessDenied,
    #[error("the service is busy")]
    ServiceBusy,
    #[error("missing procedure '{0}'")]
    MissingProcedure(String),
    #[error("connection attempt failed")]
    ConnectionAttemptFailed,
    #[error("timeout expired")]
    TimeoutExpired,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("application error {code}")]
    Application { code: i32, payload: Bytes },
    #[error("unexpected error (code {0})")]
    Unexpected(i32),
}

/// What a remote error code refers to, for the codes that carry context
#[derive(Debug, Clone, Copy)]
pub enum RequestTarget<'a> {
    VirtualPort(i32),
    Procedure(&'a str),
}

impl RequestError {
    pub fn from_code(code: i32, target: RequestTarget) -> RequestError {
        use error_code::*;

        match (code, target) {
            (CONNECTION_ATTEMPT_FAILED, _) => RequestError::ConnectionAttemptFailed,
            (SERVICE_OFFLINE, _) => RequestError::ServiceOffline,
            (ACCESS_DENIED, _) => RequestError::AccessDenied,
            (SERVICE_BUSY, _) => RequestError::ServiceBusy,
            (CLIENT_OFFLINE, _) => RequestError::ClientOffline,
            (TIMEOUT_EXPIRED, _) => RequestError::TimeoutExpired,
            (PORT_UNREACHABLE, RequestTarget::VirtualPort(port)) => RequestError::PortUnreachable(port),
            (MISSING_PROCEDURE, RequestTarget::Procedure(name)) => RequestError::MissingProcedure(name.to_string()),
            (code, _) => RequestError::Unexpected(code),
        }
    }

    pub fn code(&self) -> i32 {
        use error_code::*;

        match self {
            RequestError::ServiceOffline => SERVICE_OFFLINE,
            RequestError::ClientOffline => CLIENT_OFFLINE,
            RequestError::PortUnreachable(_) => PORT_UNREACHABLE,
            RequestError::AccessDenied => ACCESS_DENIED,
            RequestError::ServiceBusy => SERVICE_BUSY,
            RequestError::MissingProcedure(_) => MISSING_PROCEDURE,
            RequestError::ConnectionAttemptFailed => CONNECTION_ATTEMPT_FAILED,
            RequestError::TimeoutExpired => TIMEOUT_EXPIRED,
            RequestError::InvalidArgument(_) => ARGUMENT_ERROR,
            RequestError::Application { code, .. } => *code,
            RequestError::Unexpected(code) => *code,
        }
    }
}
