use std::{sync::Arc, time::Duration};

use derive_where::derive_where;

use crate::{
    client::options::{ClientOptions, Credential, TlsOptions},
    event::{cmap::CmapEvent, EventHandler},
};

/// Options a per-server connection pool is constructed with, derived from the client options.
#[derive(Clone, Default)]
#[derive_where(Debug)]
pub(crate) struct ConnectionPoolOptions {
    /// The maximum number of connections the pool may manage, including checked-out
    /// connections.
    pub(crate) max_pool_size: Option<u32>,

    /// The minimum number of connections maintenance keeps established.
    pub(crate) min_pool_size: Option<u32>,

    /// The maximum number of connections that may be establishing concurrently.
    pub(crate) max_connecting: Option<u32>,

    /// Connections unused for longer than this are pruned.
    pub(crate) max_idle_time: Option<Duration>,

    /// Connections older than this are pruned regardless of use.
    pub(crate) max_connection_life_time: Option<Duration>,

    /// How long a checkout may wait before failing with a timeout.
    pub(crate) wait_queue_timeout: Option<Duration>,

    /// The credential used to authenticate new connections.
    pub(crate) credential: Option<Credential>,

    /// Handler for pool events.
    #[derive_where(skip)]
    pub(crate) cmap_event_handler: Option<Arc<dyn EventHandler<CmapEvent>>>,

    /// Start the pool in the ready state rather than paused.
    pub(crate) ready: Option<bool>,

    /// Overrides the maintenance interval.
    #[cfg(test)]
    pub(crate) maintenance_frequency: Option<Duration>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_connecting: None,
            max_idle_time: options.max_idle_time,
            max_connection_life_time: options.max_connection_life_time,
            wait_queue_timeout: options.wait_queue_timeout,
            credential: options.credential.clone(),
            cmap_event_handler: options.cmap_event_handler.clone(),
            ready: None,
            #[cfg(test)]
            maintenance_frequency: None,
        }
    }
}

/// Options for establishing a single connection.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionOptions {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) tls_options: Option<TlsOptions>,
    pub(crate) app_name: Option<String>,
}

impl ConnectionOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
            socket_timeout: options.socket_timeout,
            tls_options: options.tls_options(),
            app_name: options.app_name.clone(),
        }
    }
}
