use serde::{Deserialize, Serialize};

/// Classification of a call outcome.
///
/// `Ok` is the only success code; every other code is a failure.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Code {
    #[default]
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    Unimplemented,
    Internal,
    Unauthenticated,
}

/// Terminal signal of every call.
///
/// Two statuses compare equal when their codes match. The message is
/// diagnostic text and is not meant to be parsed.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Status {
    code: Code,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    message: String,
}

macro_rules! status_ctor {
    ($name:ident, $code:ident) => {
        #[must_use]
        pub fn $name(message: impl Into<String>) -> Self {
            Self::new(Code::$code, message)
        }
    };
}

impl Status {
    #[must_use]
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    status_ctor!(cancelled, Cancelled);
    status_ctor!(unknown, Unknown);
    status_ctor!(invalid_argument, InvalidArgument);
    status_ctor!(deadline_exceeded, DeadlineExceeded);
    status_ctor!(not_found, NotFound);
    status_ctor!(unimplemented, Unimplemented);
    status_ctor!(internal, Internal);
    status_ctor!(unauthenticated, Unauthenticated);

    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Status {}

impl From<Code> for Status {
    fn from(code: Code) -> Self {
        Self::new(code, String::default())
    }
}

impl std::error::Error for Status {}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

/// Maps transport failures onto the status taxonomy.
impl From<std::io::Error> for Status {
    fn from(value: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match value.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Code::Internal,
            ErrorKind::TimedOut => Code::DeadlineExceeded,
            // secure transports report a rejected peer identity this way.
            ErrorKind::PermissionDenied => Code::Unauthenticated,
            _ => Code::Unknown,
        };
        Self::new(code, value.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Status {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(value.to_string())
    }
}

impl From<std::num::TryFromIntError> for Status {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self::invalid_argument(value.to_string())
    }
}

impl From<serde_json::Error> for Status {
    fn from(value: serde_json::Error) -> Self {
        let code = if value.is_io() {
            Code::Internal
        } else {
            Code::InvalidArgument
        };
        Self::new(code, value.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Status {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self::internal(value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Status {
    fn from(value: rmp_serde::decode::Error) -> Self {
        Self::invalid_argument(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Status>;
