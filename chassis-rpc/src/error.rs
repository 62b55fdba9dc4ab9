//! RPC error types and the remote error translation table.
//!
//! Handler failures cross the wire as `(type name, args, repr)` triples.
//! On the client an [`ErrorTable`] maps the qualified type name back to a
//! constructor; names it does not know arrive as [`GenericError`].

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::value::Value;

/// Boxed error reconstructed from a remote failure.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Dispatch could not resolve a dotted method name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}")]
pub struct NotFoundError {
    pub name: String,
}

impl NotFoundError {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Argument binding or annotation validation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ParametersError {
    pub message: String,
}

impl ParametersError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The service's transport is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Service closed")]
pub struct ServiceClosedError;

/// An annotation rejected a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CoerceError(pub String);

impl CoerceError {
    pub fn expected(what: &str, got: &Value) -> Self {
        Self(format!("expected {what}, got {}", got.kind()))
    }
}

/// A remote failure whose type the client could not reconstruct.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{type_name}: {repr}")]
pub struct GenericError {
    pub type_name: String,
    pub args: Vec<Value>,
    pub repr: String,
}

/// An endpoint declaration is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("duplicate parameter name {0:?}")]
    DuplicateParameter(String),

    #[error("non-default argument {0:?} follows default argument")]
    RequiredAfterDefault(String),

    #[error("parameter {0:?} is out of order")]
    OutOfOrder(String),

    #[error("more than one {0} parameter")]
    DuplicateVariadic(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("No translation registered for {0}")]
    NoTranslation(&'static str),

    #[error("String is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("Expected {expected}, got {found}")]
    UnexpectedType { expected: &'static str, found: String },
}

impl CodecError {
    pub fn unexpected(expected: &'static str, found: &Value) -> Self {
        Self::UnexpectedType {
            expected,
            found: found.kind().to_string(),
        }
    }
}

/// Outcome of a failed client call.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    ServiceClosed(#[from] ServiceClosedError),

    #[error("Method name is empty")]
    EmptyMethodName,

    #[error("Call timed out")]
    Timeout,

    #[error("Call cancelled")]
    Cancelled,

    /// Remote failure rebuilt through the error table.
    #[error(transparent)]
    Remote(BoxError),

    #[error(transparent)]
    Generic(#[from] GenericError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] chassis_core::Error),
}

impl CallError {
    /// The reconstructed remote error, if it has type `E`.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            CallError::Remote(e) => e.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CallError::Cancelled | CallError::Timeout)
    }
}

/// Errors a handler can raise to its caller.
///
/// The type name is what the client looks up in its [`ErrorTable`]; the
/// arguments are what the table's constructor receives.
pub trait RemoteError: StdError {
    fn type_name(&self) -> String;

    fn remote_args(&self) -> Vec<Value> {
        vec![Value::from(self.to_string())]
    }
}

impl RemoteError for NotFoundError {
    fn type_name(&self) -> String {
        "chassis_rpc::NotFoundError".into()
    }

    fn remote_args(&self) -> Vec<Value> {
        vec![Value::from(self.name.as_str())]
    }
}

impl RemoteError for ParametersError {
    fn type_name(&self) -> String {
        "chassis_rpc::ParametersError".into()
    }
}

impl RemoteError for ServiceClosedError {
    fn type_name(&self) -> String {
        "chassis_rpc::ServiceClosedError".into()
    }

    fn remote_args(&self) -> Vec<Value> {
        Vec::new()
    }
}

impl RemoteError for CoerceError {
    fn type_name(&self) -> String {
        "chassis_rpc::CoerceError".into()
    }
}

impl RemoteError for CodecError {
    fn type_name(&self) -> String {
        "chassis_rpc::CodecError".into()
    }
}

impl RemoteError for io::Error {
    fn type_name(&self) -> String {
        "std::io::Error".into()
    }

    fn remote_args(&self) -> Vec<Value> {
        vec![
            Value::from(format!("{:?}", self.kind())),
            Value::from(self.to_string()),
        ]
    }
}

impl RemoteError for fmt::Error {
    fn type_name(&self) -> String {
        "std::fmt::Error".into()
    }

    fn remote_args(&self) -> Vec<Value> {
        Vec::new()
    }
}

/// A failure raised by a handler, in wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub type_name: String,
    pub args: Vec<Value>,
    pub message: String,
}

impl HandlerError {
    pub fn new(type_name: impl Into<String>, args: Vec<Value>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            args,
            message: message.into(),
        }
    }

    /// Diagnostic rendering sent along with the type name and args.
    pub fn repr(&self) -> String {
        let short = self.type_name.rsplit("::").next().unwrap_or(&self.type_name);
        let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
        format!("{short}({})", args.join(", "))
    }

    /// Wire payload: `[type name, args, repr]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.type_name.as_str()),
            Value::Array(self.args.clone()),
            Value::from(self.repr()),
        ])
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl<E: RemoteError> From<E> for HandlerError {
    fn from(e: E) -> Self {
        Self {
            type_name: e.type_name(),
            args: e.remote_args(),
            message: e.to_string(),
        }
    }
}

type Constructor = Arc<dyn Fn(&[Value]) -> Option<BoxError> + Send + Sync>;

/// Qualified type name → constructor of the local error.
#[derive(Clone, Default)]
pub struct ErrorTable {
    entries: HashMap<String, Constructor>,
}

static DEFAULT_ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(build_default_error_table);

fn str_arg(args: &[Value], i: usize) -> Option<String> {
    args.get(i).and_then(Value::as_str).map(str::to_string)
}

fn io_kind(name: &str) -> io::ErrorKind {
    use io::ErrorKind::*;
    match name {
        "NotFound" => NotFound,
        "PermissionDenied" => PermissionDenied,
        "ConnectionRefused" => ConnectionRefused,
        "ConnectionReset" => ConnectionReset,
        "ConnectionAborted" => ConnectionAborted,
        "NotConnected" => NotConnected,
        "AddrInUse" => AddrInUse,
        "AddrNotAvailable" => AddrNotAvailable,
        "BrokenPipe" => BrokenPipe,
        "AlreadyExists" => AlreadyExists,
        "WouldBlock" => WouldBlock,
        "InvalidInput" => InvalidInput,
        "InvalidData" => InvalidData,
        "TimedOut" => TimedOut,
        "WriteZero" => WriteZero,
        "Interrupted" => Interrupted,
        "Unsupported" => Unsupported,
        "UnexpectedEof" => UnexpectedEof,
        "OutOfMemory" => OutOfMemory,
        _ => Other,
    }
}

fn build_default_error_table() -> ErrorTable {
    ErrorTable::new()
        .with("std::io::Error", |args| {
            let kind = io_kind(&str_arg(args, 0)?);
            let message = str_arg(args, 1)?;
            Some(Box::new(io::Error::new(kind, message)))
        })
        .with("std::fmt::Error", |_| Some(Box::new(fmt::Error)))
        .with("chassis_rpc::NotFoundError", |args| {
            Some(Box::new(NotFoundError::new(str_arg(args, 0)?)))
        })
        .with("chassis_rpc::ParametersError", |args| {
            Some(Box::new(ParametersError::new(str_arg(args, 0)?)))
        })
        .with("chassis_rpc::ServiceClosedError", |_| Some(Box::new(ServiceClosedError)))
        .with("chassis_rpc::CoerceError", |args| {
            Some(Box::new(CoerceError(str_arg(args, 0)?)))
        })
}

impl ErrorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default table.
    pub fn default_table() -> &'static ErrorTable {
        &DEFAULT_ERROR_TABLE
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Option<BoxError> + Send + Sync + 'static,
    {
        self.entries.insert(type_name.into(), Arc::new(constructor));
        self
    }

    #[must_use]
    pub fn with<F>(mut self, type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&[Value]) -> Option<BoxError> + Send + Sync + 'static,
    {
        self.register(type_name, constructor);
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn construct(&self, type_name: &str, args: &[Value]) -> Option<Option<BoxError>> {
        self.entries.get(type_name).map(|ctor| ctor(args))
    }

    /// Rebuild a remote failure, consulting `self` before the defaults.
    ///
    /// Unknown names, and constructors that reject the args, give a
    /// [`GenericError`].
    pub fn translate(&self, type_name: &str, args: Vec<Value>, repr: String) -> CallError {
        let built = self
            .construct(type_name, &args)
            .or_else(|| Self::default_table().construct(type_name, &args))
            .flatten();
        match built {
            Some(e) => CallError::Remote(e),
            None => CallError::Generic(GenericError {
                type_name: type_name.to_string(),
                args,
                repr,
            }),
        }
    }
}

impl fmt::Debug for ErrorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("ErrorTable").field("entries", &names).finish()
    }
}
