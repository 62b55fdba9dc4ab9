//! Client and server configuration.
//!
//! All three patterns share the same two builders; the aliases name the
//! combinations each entry point takes. Options a pattern has no use for
//! (a timeout on a pipeline client, subscriptions on an RPC server) are
//! ignored.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chassis_core::connection::{ConnectionOptions, Endpoints};
use chassis_core::context::Context;
use chassis_core::socket::MqSocket;
use hashbrown::HashSet;

use crate::codec::TranslationTable;
use crate::error::ErrorTable;

/// Connection and codec options for the client side.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub connection: ConnectionOptions,
    /// Extension entries consulted before the default table.
    pub translation_table: Option<TranslationTable>,
    /// Error constructors consulted before the default table.
    pub error_table: Option<ErrorTable>,
    /// Default per-call timeout; `None` waits forever.
    pub timeout: Option<Duration>,
}

/// Connection, codec and logging options for the server side.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub connection: ConnectionOptions,
    pub translation_table: Option<TranslationTable>,
    /// Log handler failures at error level.
    pub log_exceptions: bool,
    /// Qualified error type names never logged.
    pub exclude_log_exceptions: HashSet<String>,
    /// Prefix filters a pub/sub server subscribes to at startup.
    pub subscribe: Vec<Bytes>,
}

pub type RpcClientConfig = ClientConfig;
pub type RpcServerConfig = ServerConfig;
pub type PipelineClientConfig = ClientConfig;
pub type PipelineServerConfig = ServerConfig;
pub type PubSubClientConfig = ClientConfig;
pub type PubSubServerConfig = ServerConfig;

impl ClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bind(mut self, endpoints: impl Into<Endpoints>) -> Self {
        self.connection = self.connection.bind(endpoints);
        self
    }

    #[must_use]
    pub fn connect(mut self, endpoints: impl Into<Endpoints>) -> Self {
        self.connection = self.connection.connect(endpoints);
        self
    }

    /// Adopt an existing socket.
    #[must_use]
    pub fn socket(mut self, socket: Arc<dyn MqSocket>) -> Self {
        self.connection = self.connection.socket(socket);
        self
    }

    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.connection = self.connection.context(context);
        self
    }

    #[must_use]
    pub fn translation_table(mut self, table: TranslationTable) -> Self {
        self.translation_table = Some(table);
        self
    }

    #[must_use]
    pub fn error_table(mut self, table: ErrorTable) -> Self {
        self.error_table = Some(table);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl ServerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bind(mut self, endpoints: impl Into<Endpoints>) -> Self {
        self.connection = self.connection.bind(endpoints);
        self
    }

    #[must_use]
    pub fn connect(mut self, endpoints: impl Into<Endpoints>) -> Self {
        self.connection = self.connection.connect(endpoints);
        self
    }

    #[must_use]
    pub fn socket(mut self, socket: Arc<dyn MqSocket>) -> Self {
        self.connection = self.connection.socket(socket);
        self
    }

    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.connection = self.connection.context(context);
        self
    }

    #[must_use]
    pub fn translation_table(mut self, table: TranslationTable) -> Self {
        self.translation_table = Some(table);
        self
    }

    #[must_use]
    pub fn log_exceptions(mut self, enabled: bool) -> Self {
        self.log_exceptions = enabled;
        self
    }

    /// Never log failures of the given qualified type names.
    #[must_use]
    pub fn exclude_log_exceptions<I, S>(mut self, type_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_log_exceptions
            .extend(type_names.into_iter().map(Into::into));
        self
    }

    /// Subscribe to `filter` at startup (pub/sub servers only).
    #[must_use]
    pub fn subscribe(mut self, filter: impl Into<Bytes>) -> Self {
        self.subscribe.push(filter.into());
        self
    }
}
