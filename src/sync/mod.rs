//! Blocking wrappers over the asynchronous API.
//!
//! Each blocking client owns a private multi-threaded runtime on which the driver's background
//! tasks (monitors, pool workers) make progress; public methods block the calling thread on
//! the equivalent async call. Cancellation and timeout behavior is identical to the async API,
//! since the same core executes underneath.

use std::sync::Arc;

use crate::{
    bson::Document,
    error::Result,
    selection_criteria::SelectionCriteria,
    ClientOptions,
};

/// A blocking handle to a MongoDB deployment.
#[derive(Clone, Debug)]
pub struct Client {
    async_client: crate::Client,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl Client {
    /// Create a blocking client configured by `options`.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(crate::error::Error::from)?;
        let async_client = {
            let _guard = runtime.enter();
            crate::Client::with_options(options)?
        };
        Ok(Self {
            async_client,
            runtime: Arc::new(runtime),
        })
    }

    /// Create a blocking client from a `mongodb://` connection string.
    pub fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        Self::with_options(ClientOptions::parse(uri)?)
    }

    /// Run a database command verbatim against `db`, routed to the primary.
    pub fn run_command(&self, db: impl AsRef<str>, command: Document) -> Result<Document> {
        self.runtime
            .block_on(self.async_client.run_command(db, command))
    }

    /// Run a database command against a server chosen by `selection_criteria`.
    pub fn run_command_with_selection(
        &self,
        db: impl AsRef<str>,
        command: Document,
        selection_criteria: SelectionCriteria,
    ) -> Result<Document> {
        self.runtime.block_on(self.async_client.run_command_with_selection(
            db,
            command,
            selection_criteria,
        ))
    }

    /// Shut the client down: stop all monitors and close all connection pools.
    pub fn shutdown(&self) {
        self.runtime.block_on(self.async_client.shutdown())
    }

    /// The async client this blocking client wraps.
    pub fn async_client(&self) -> &crate::Client {
        &self.async_client
    }
}
