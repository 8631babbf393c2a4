use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    AlreadyExists,
    Permission,
    Io,
    Alloc,
    Spawn,
    ShortRead,
    ShortWrite,
    Overflow,
    Closed,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    path: Option<PathBuf>,
    offset: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            path: None,
            offset: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub(crate) fn from_io(err: io::Error) -> Self {
        Self::new(io_error_kind(&err)).with_source(err)
    }
}

impl Error {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Everything `Display` shows after the kind.
    fn detail(&self) -> String {
        let mut parts = Vec::new();
        if let Some(message) = &self.message {
            parts.push(message.clone());
        }
        if let Some(path) = &self.path {
            parts.push(format!("(path: {})", path.display()));
        }
        if let Some(offset) = self.offset {
            parts.push(format!("(offset: {offset})"));
        }
        let mut detail = parts.join(" ");
        if let Some(source) = &self.source {
            if detail.is_empty() {
                detail = source.to_string();
            } else {
                detail = format!("{detail}: {source}");
            }
        }
        detail
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let detail = self.detail();
        if detail.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {detail}", self.kind)
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

/// Sticky record of a permanent reader/writer failure.
///
/// `Error` owns its source and cannot be cloned, so objects keep this compact
/// form and rebuild an `Error` on every call that has to report it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fault {
    kind: ErrorKind,
    message: String,
}

impl Fault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn to_error(&self) -> Error {
        Error::new(self.kind).with_message(self.message.clone())
    }
}

impl From<&Error> for Fault {
    fn from(err: &Error) -> Self {
        Self::new(err.kind, err.detail())
    }
}

pub(crate) fn io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::AlreadyExists => 4,
        ErrorKind::Permission => 5,
        ErrorKind::Io => 6,
        ErrorKind::Alloc => 7,
        ErrorKind::Spawn => 8,
        ErrorKind::ShortRead => 9,
        ErrorKind::ShortWrite => 10,
        ErrorKind::Overflow => 11,
        ErrorKind::Closed => 12,
    }
}
