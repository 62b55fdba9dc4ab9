//! Chainable method-call builder shared by all clients.
//!
//! ```no_run
//! # use chassis_rpc::{args, kwargs};
//! # async fn demo(client: chassis_rpc::rpc::RpcClient) -> Result<(), chassis_rpc::CallError> {
//! let _sum = client.call().attr("math").attr("add").call(args![1, 2], kwargs! {}).await?;
//! # Ok(()) }
//! ```

use crate::error::CallError;
use crate::value::{Kwargs, Value};

/// Target a [`MethodCall`] dispatches to.
pub trait Invoke: Clone {
    type Output;

    fn invoke(&self, name: String, args: Vec<Value>, kwargs: Kwargs) -> Self::Output;

    /// Output for a call that fails before anything is sent.
    fn fail(&self, error: CallError) -> Self::Output;
}

/// An immutable accumulation of dotted-name segments.
#[derive(Debug, Clone)]
pub struct MethodCall<C> {
    target: C,
    segments: Vec<String>,
}

impl<C: Invoke> MethodCall<C> {
    pub(crate) fn new(target: C) -> Self {
        Self {
            target,
            segments: Vec::new(),
        }
    }

    /// A new builder with `segment` appended.
    #[must_use]
    pub fn attr(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self {
            target: self.target.clone(),
            segments,
        }
    }

    /// A new builder with every segment of a dotted `path` appended.
    #[must_use]
    pub fn path(&self, path: &str) -> Self {
        let mut next = self.clone();
        next.segments
            .extend(path.split('.').filter(|s| !s.is_empty()).map(str::to_string));
        next
    }

    /// The dotted name built so far.
    pub fn name(&self) -> String {
        self.segments.join(".")
    }

    /// Invoke the accumulated method.
    pub fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> C::Output {
        if self.segments.is_empty() {
            return self.target.fail(CallError::EmptyMethodName);
        }
        self.target.invoke(self.name(), args, kwargs)
    }
}
