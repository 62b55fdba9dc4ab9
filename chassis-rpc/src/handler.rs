//! Handler trees and method dispatch.
//!
//! Servers expose a tree of [`Handler`]s. Looking up a dotted name walks the
//! tree one segment at a time; every intermediate segment must resolve to a
//! nested handler and the last one to a registered [`Endpoint`]. Plain
//! values stored in a namespace are visible to lookups but never callable.
//!
//! # Examples
//!
//! ```
//! use chassis_rpc::error::HandlerError;
//! use chassis_rpc::handler::{dispatch, Endpoint, Namespace};
//! use chassis_rpc::signature::{coerce, Param, Signature};
//! use chassis_rpc::Value;
//!
//! let add = Endpoint::new(
//!     "add",
//!     Signature::new()
//!         .param(Param::new("a").annotate(coerce::int()))
//!         .param(Param::new("b").annotate(coerce::int())),
//!     |args| {
//!         let sum = args.int("a")?.checked_add(args.int("b")?);
//!         sum.map(Value::from)
//!             .ok_or_else(|| HandlerError::new("math::Overflow", vec![], "integer overflow"))
//!     },
//! )
//! .unwrap();
//!
//! let root = Namespace::new().namespace("math", Namespace::new().endpoint(add));
//! assert!(dispatch(&root, "math.add").is_ok());
//! assert_eq!(dispatch(&root, "math.sub").unwrap_err().name, "math.sub");
//! ```

use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use hashbrown::HashMap;

use crate::error::{HandlerError, NotFoundError, SignatureError};
use crate::signature::{BoundArgs, Signature};
use crate::value::Value;

/// Result of one handler invocation.
pub type HandlerResult = Result<Value, HandlerError>;

/// Something a dotted-name segment can resolve to.
#[derive(Clone)]
pub enum Entry {
    Namespace(Rc<dyn Handler>),
    Endpoint(Rc<Endpoint>),
    /// A plain attribute; visible to lookups, never dispatchable.
    Value(Value),
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Namespace(_) => f.write_str("Namespace(..)"),
            Entry::Endpoint(e) => write!(f, "Endpoint({:?})", e.name()),
            Entry::Value(v) => write!(f, "Value({v})"),
        }
    }
}

/// A node of the handler tree.
pub trait Handler {
    fn lookup(&self, name: &str) -> Option<Entry>;
}

impl<H: Handler + ?Sized> Handler for Rc<H> {
    fn lookup(&self, name: &str) -> Option<Entry> {
        (**self).lookup(name)
    }
}

enum Invoker {
    Sync(Box<dyn Fn(BoundArgs) -> HandlerResult>),
    Async(Box<dyn Fn(BoundArgs) -> LocalBoxFuture<'static, HandlerResult>>),
}

/// What invoking an endpoint produced.
pub enum Outcome {
    /// A synchronous handler already ran.
    Ready(HandlerResult),
    /// An asynchronous handler that still has to be driven.
    Pending(LocalBoxFuture<'static, HandlerResult>),
}

/// A callable registered for remote invocation, with its signature.
pub struct Endpoint {
    name: String,
    signature: Signature,
    invoker: Invoker,
}

impl Endpoint {
    /// Register a synchronous handler.
    pub fn new<F, V>(name: impl Into<String>, signature: Signature, f: F) -> Result<Self, SignatureError>
    where
        F: Fn(BoundArgs) -> Result<V, HandlerError> + 'static,
        V: Into<Value>,
    {
        signature.validate()?;
        Ok(Self {
            name: name.into(),
            signature,
            invoker: Invoker::Sync(Box::new(move |args| f(args).map(Into::into))),
        })
    }

    /// Register a handler that returns a future.
    pub fn new_async<F, Fut, V>(
        name: impl Into<String>,
        signature: Signature,
        f: F,
    ) -> Result<Self, SignatureError>
    where
        F: Fn(BoundArgs) -> Fut + 'static,
        Fut: Future<Output = Result<V, HandlerError>> + 'static,
        V: Into<Value>,
    {
        signature.validate()?;
        Ok(Self {
            name: name.into(),
            signature,
            invoker: Invoker::Async(Box::new(move |args| {
                f(args).map(|r| r.map(Into::into)).boxed_local()
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_async(&self) -> bool {
        matches!(self.invoker, Invoker::Async(_))
    }

    /// Run the handler on already-bound arguments.
    pub fn invoke(&self, args: BoundArgs) -> Outcome {
        match &self.invoker {
            Invoker::Sync(f) => Outcome::Ready(f(args)),
            Invoker::Async(f) => Outcome::Pending(f(args)),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("async", &self.is_async())
            .finish()
    }
}

/// A map-backed handler.
#[derive(Default, Clone)]
pub struct Namespace {
    entries: HashMap<String, Entry>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint under its own name.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.entries
            .insert(endpoint.name.clone(), Entry::Endpoint(Rc::new(endpoint)));
        self
    }

    #[must_use]
    pub fn namespace(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.entries
            .insert(name.into(), Entry::Namespace(Rc::new(handler)));
        self
    }

    #[must_use]
    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(name.into(), Entry::Value(value.into()));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: Entry) -> Option<Entry> {
        self.entries.insert(name.into(), entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Handler for Namespace {
    fn lookup(&self, name: &str) -> Option<Entry> {
        self.entries.get(name).cloned()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

/// Resolve a dotted method name against `root`.
///
/// Any broken link fails with the full dotted name.
pub fn dispatch(root: &dyn Handler, name: &str) -> Result<Rc<Endpoint>, NotFoundError> {
    let not_found = || NotFoundError::new(name);
    if name.is_empty() {
        return Err(not_found());
    }

    let mut segments = name.split('.');
    let method = segments.next_back().ok_or_else(not_found)?;

    let mut nested: Option<Rc<dyn Handler>> = None;
    for segment in segments {
        let entry = nested.as_deref().unwrap_or(root).lookup(segment);
        match entry {
            Some(Entry::Namespace(handler)) => nested = Some(handler),
            _ => return Err(not_found()),
        }
    }

    match nested.as_deref().unwrap_or(root).lookup(method) {
        Some(Entry::Endpoint(endpoint)) => Ok(endpoint),
        _ => Err(not_found()),
    }
}
