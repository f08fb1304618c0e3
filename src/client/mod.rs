pub(crate) mod executor;
pub mod options;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    bson::Document,
    error::Result,
    operation::RunCommand,
    sdam::Topology,
    selection_criteria::SelectionCriteria,
};

use options::ClientOptions;

/// A handle to a MongoDB deployment.
///
/// The client tracks the deployment through background monitor tasks and maintains one
/// connection pool per known server; cloning it is cheap, and all clones share that state. All
/// of the driver's state is dropped once every clone is gone, or eagerly via
/// [`shutdown`](Client::shutdown).
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
    shutdown: AtomicBool,
}

impl Client {
    /// Create a client configured by `options`.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let topology = Topology::new(options.clone())?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                topology,
                options,
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Create a client from a `mongodb://` connection string.
    pub fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        Self::with_options(ClientOptions::parse(uri)?)
    }

    /// Run a database command verbatim against `db`, routed to the primary.
    ///
    /// This is the generic escape hatch onto the wire protocol; commands are sent exactly as
    /// given.
    pub async fn run_command(&self, db: impl AsRef<str>, command: Document) -> Result<Document> {
        let operation = RunCommand::new(db.as_ref(), command, None)?;
        self.execute_operation(operation).await
    }

    /// Run a database command against a server chosen by `selection_criteria`.
    pub async fn run_command_with_selection(
        &self,
        db: impl AsRef<str>,
        command: Document,
        selection_criteria: SelectionCriteria,
    ) -> Result<Document> {
        let operation = RunCommand::new(db.as_ref(), command, Some(selection_criteria))?;
        self.execute_operation(operation).await
    }

    /// Shut the client down: stop all monitors and close all connection pools. Subsequent
    /// operations fail with a shutdown error.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.topology.shutdown().await;
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }
}
