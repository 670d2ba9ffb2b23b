use jsonrpc_core::{Error, ErrorCode};
use serde_json::json;

pub type LeashResult<T> = std::result::Result<T, LeashError>;

/// Engine-internal error, carried as a JSON-RPC error object so that
/// server-produced rejections and locally-produced failures share one shape.
#[derive(Debug, Clone)]
pub struct LeashError(Error);

impl From<LeashError> for String {
    fn from(e: LeashError) -> Self {
        e.to_string()
    }
}

impl From<LeashError> for Error {
    fn from(e: LeashError) -> Self {
        e.0
    }
}

impl From<Error> for LeashError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl std::error::Error for LeashError {}

impl std::fmt::Display for LeashError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let Error {
            code,
            message,
            data,
        } = &self.0;

        let core = if code.description().eq(message) {
            code.description()
        } else {
            format!("{}: {}", code.description(), message)
        };

        if let Some(data_value) = data {
            write!(f, "{}: {}", core, data_value.to_string().as_str())
        } else {
            write!(f, "{}", core)
        }
    }
}

impl LeashError {
    /// Socket-level failure; always followed by a reconnect attempt.
    pub fn transport<T>(e: T) -> Self
    where
        T: ToString,
    {
        let mut error = Error::new(ErrorCode::ServerError(-32001));
        error.message = "Transport failure".to_string();
        error.data = Some(json!(e.to_string()));
        Self(error)
    }

    /// Malformed or unexpected JSON-RPC frame; dropped, never a reconnect
    /// trigger.
    pub fn protocol<T>(e: T) -> Self
    where
        T: ToString,
    {
        let mut error = Error::new(ErrorCode::ParseError);
        error.message = "Unreadable frame".to_string();
        error.data = Some(json!(e.to_string()));
        Self(error)
    }

    /// The server declined a subscribe request; surfaced on the caller's
    /// handle, not as a connection failure.
    pub fn subscription_rejected(key: &str, e: Error) -> Self {
        let mut error = e;
        error.data = Some(json!(format!("Subscription {} rejected", key)));
        Self(error)
    }

    pub fn channel_closed(name: &str) -> Self {
        let mut error = Error::internal_error();
        error.data = Some(json!(format!("Channel {} closed", name)));
        Self(error)
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }
}
