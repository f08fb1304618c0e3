mod handshake;

#[cfg(test)]
use std::sync::Arc;

use crate::{
    client::options::{ClientOptions, Credential, ServerAddress},
    error::{Error, Result},
    hello::HelloReply,
    sdam::HandshakePhase,
};

#[cfg(test)]
use crate::BoxFuture;

use super::{
    conn::{Connection, PendingConnection},
    options::ConnectionOptions,
};

pub(crate) use handshake::Handshaker;

/// The options needed to build a [`ConnectionEstablisher`].
#[derive(Clone, Debug, Default)]
pub(crate) struct EstablisherOptions {
    pub(crate) connection_options: ConnectionOptions,
}

impl EstablisherOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            connection_options: ConnectionOptions::from_client_options(options),
        }
    }
}

/// Contains the logic to establish a connection: opening the socket, performing TLS when
/// configured, and running the connection handshake.
#[derive(Clone)]
pub(crate) struct ConnectionEstablisher {
    inner: EstablisherInner,
}

#[derive(Clone)]
enum EstablisherInner {
    Wire {
        handshaker: Handshaker,
        options: ConnectionOptions,
    },
    /// Replaces socket establishment wholesale; pool behavior tests use this to control when
    /// and how opens complete.
    #[cfg(test)]
    Mock(MockEstablishFn),
}

#[cfg(test)]
pub(crate) type MockEstablishFn =
    Arc<dyn Fn(PendingConnection) -> BoxFuture<'static, Result<Connection>> + Send + Sync>;

impl std::fmt::Debug for ConnectionEstablisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEstablisher").finish()
    }
}

impl ConnectionEstablisher {
    pub(crate) fn new(options: EstablisherOptions) -> Self {
        Self {
            inner: EstablisherInner::Wire {
                handshaker: Handshaker::new(options.connection_options.app_name.clone()),
                options: options.connection_options,
            },
        }
    }

    #[cfg(test)]
    pub(crate) fn mock(
        establish: impl Fn(PendingConnection) -> BoxFuture<'static, Result<Connection>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            inner: EstablisherInner::Mock(Arc::new(establish)),
        }
    }

    /// Establishes a connection for use in a pool.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
        _credential: Option<&Credential>,
    ) -> std::result::Result<Connection, EstablishError> {
        let generation = pending_connection.generation;
        match &self.inner {
            EstablisherInner::Wire {
                handshaker,
                options,
            } => {
                let mut connection = Connection::connect_pending(&pending_connection, options)
                    .await
                    .map_err(|e| EstablishError::pre_hello(e, generation))?;
                handshaker
                    .handshake(&mut connection)
                    .await
                    .map_err(|e| EstablishError::post_hello(e, generation))?;
                Ok(connection)
            }
            #[cfg(test)]
            EstablisherInner::Mock(establish) => establish(pending_connection)
                .await
                .map_err(|e| EstablishError::pre_hello(e, generation)),
        }
    }

    /// Establishes a monitoring connection, returning the handshake reply along with it.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
    ) -> Result<(Connection, HelloReply)> {
        match &self.inner {
            EstablisherInner::Wire {
                handshaker,
                options,
            } => {
                let mut connection = Connection::connect_monitoring(address, options).await?;
                let reply = handshaker.handshake(&mut connection).await?;
                Ok((connection, reply))
            }
            #[cfg(test)]
            EstablisherInner::Mock(_) => Err(Error::internal(
                "mock establishers do not support monitoring connections",
            )),
        }
    }
}

/// An error that occurred during connection establishment, labeled with how far the handshake
/// had progressed. The phase determines how SDAM reacts to the error.
#[derive(Clone, Debug)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    fn pre_hello(cause: Error, generation: u32) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        }
    }

    fn post_hello(cause: Error, generation: u32) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PostHello { generation },
        }
    }
}
