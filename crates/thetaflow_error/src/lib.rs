use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error::Error;
use std::fmt;

pub type Result<T, E = FlowError> = std::result::Result<T, E>;

/// Broad classification of an error.
///
/// The kind decides how the engine reacts: configuration errors fail setup,
/// predicate errors are isolated to a single pair, everything else aborts the
/// join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid parallelism, cardinality, key type or setting.
    Configuration,
    /// A message couldn't be delivered within the retry budget.
    Delivery,
    /// Evaluating the join predicate failed for a pair of tuples.
    Predicate,
    /// Spill storage failed (io, decoding).
    Storage,
    /// Epoch or migration protocol was violated.
    Protocol,
    /// The join was canceled.
    Canceled,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Delivery => "delivery",
            Self::Predicate => "predicate",
            Self::Storage => "storage",
            Self::Protocol => "protocol",
            Self::Canceled => "canceled",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
pub struct FlowError {
    inner: Box<FlowErrorInner>,
}

struct FlowErrorInner {
    msg: String,
    kind: ErrorKind,
    source: Option<Box<dyn Error + Send + Sync>>,
    fields: Vec<(Cow<'static, str>, String)>,
    backtrace: Backtrace,
}

impl fmt::Debug for FlowErrorInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowError")
            .field("msg", &self.msg)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("fields", &self.fields)
            .finish()
    }
}

impl FlowError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Other, msg)
    }

    pub fn with_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        FlowError {
            inner: Box::new(FlowErrorInner {
                msg: msg.into(),
                kind,
                source: None,
                fields: Vec::new(),
                backtrace: Backtrace::capture(),
            }),
        }
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        let mut err = Self::new(msg);
        err.inner.source = Some(source);
        err
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Configuration, msg)
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Delivery, msg)
    }

    pub fn predicate(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Predicate, msg)
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Storage, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Protocol, msg)
    }

    pub fn canceled(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Canceled, msg)
    }

    /// Attach a structured field to the error, displayed alongside the
    /// message.
    pub fn with_field<V>(mut self, key: impl Into<Cow<'static, str>>, value: V) -> Self
    where
        V: fmt::Display,
    {
        self.inner.fields.push((key.into(), value.to_string()));
        self
    }

    /// Override the kind of this error.
    ///
    /// Useful when a generic error (e.g. io) should be classified by the
    /// caller.
    pub fn kind_of(mut self, kind: ErrorKind) -> Self {
        self.inner.kind = kind;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn get_msg(&self) -> &str {
        &self.inner.msg
    }

    pub fn get_field(&self, key: &str) -> Option<&str> {
        self.inner
            .fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_backtrace(&self) -> &Backtrace {
        &self.inner.backtrace
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;

        if !self.inner.fields.is_empty() {
            write!(f, " (")?;
            for (idx, (key, val)) in self.inner.fields.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}: {val}")?;
            }
            write!(f, ")")?;
        }

        if let Some(source) = &self.inner.source {
            write!(f, "\nError source: {source}")?;
        }

        if self.inner.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nBacktrace: {}", self.inner.backtrace)?;
        }

        Ok(())
    }
}

impl Error for FlowError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for FlowError {
    fn from(value: std::io::Error) -> Self {
        FlowError::with_source("IO error", Box::new(value)).kind_of(ErrorKind::Storage)
    }
}

impl From<fmt::Error> for FlowError {
    fn from(value: fmt::Error) -> Self {
        FlowError::with_source("Format error", Box::new(value))
    }
}

/// Wrap errors from other crates with additional context.
pub trait ResultExt<T, E> {
    fn context(self, msg: &'static str) -> Result<T, FlowError>;

    fn context_fn<F>(self, f: F) -> Result<T, FlowError>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T, E> for std::result::Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T, FlowError> {
        self.map_err(|e| FlowError::with_source(msg, Box::new(e)))
    }

    fn context_fn<F>(self, f: F) -> Result<T, FlowError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| FlowError::with_source(f(), Box::new(e)))
    }
}

pub trait OptionExt<T> {
    /// Return an error if the option is None.
    fn required(self, msg: &'static str) -> Result<T, FlowError>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, msg: &'static str) -> Result<T, FlowError> {
        match self {
            Some(v) => Ok(v),
            None => Err(FlowError::new(format!("Missing required value: {msg}"))),
        }
    }
}
