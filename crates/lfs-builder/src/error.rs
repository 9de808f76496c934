use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A supposedly complete local artifact does not match its checksum.
    Integrity,
    /// Fetching exhausted its retries or was interrupted.
    Acquisition,
    /// A stage names a source that is not a registered package.
    UnresolvedReference,
    Io,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Integrity => "integrity error",
            ErrorKind::Acquisition => "acquisition error",
            ErrorKind::UnresolvedReference => "unresolved reference",
            ErrorKind::Io => "io error",
            ErrorKind::Configuration => "configuration error",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    // Plain messages are configuration problems unless stated otherwise.
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Configuration, msg)
    }

    pub fn integrity<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Integrity, msg)
    }

    pub fn acquisition<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Acquisition, msg)
    }

    pub fn unresolved<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::UnresolvedReference, msg)
    }

    pub fn io<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
