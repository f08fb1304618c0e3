//! Events emitted by connection pools.

use crate::client::options::ServerAddress;

/// The reason a connection was closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection had been idle longer than the configured maximum idle time.
    Idle,

    /// The connection had been alive longer than the configured maximum lifetime.
    Expired,

    /// The connection belonged to a previous pool generation.
    Stale,

    /// An error occurred on the connection.
    Error,

    /// The pool the connection belonged to was closed.
    PoolClosed,

    /// The connection was dropped while still in an unusable state (e.g. mid-exhaust).
    Dropped,
}

/// The reason a checkout attempt failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CheckoutFailedReason {
    /// The checkout timed out in the wait queue.
    Timeout,

    /// The pool was cleared or closed before the checkout could complete.
    ConnectionError,
}

/// An event emitted by a connection pool.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum CmapEvent {
    /// A pool was created for a server.
    PoolCreated {
        /// The server the pool connects to.
        address: ServerAddress,
    },

    /// A pool transitioned to the ready state.
    PoolReady {
        /// The server the pool connects to.
        address: ServerAddress,
    },

    /// A pool was cleared, incrementing its generation.
    PoolCleared {
        /// The server the pool connects to.
        address: ServerAddress,
    },

    /// A pool was closed.
    PoolClosed {
        /// The server the pool connects to.
        address: ServerAddress,
    },

    /// A connection began being established.
    ConnectionCreated {
        /// The server the connection is for.
        address: ServerAddress,
        /// The pool-local id of the connection.
        connection_id: u32,
    },

    /// A connection finished its handshake and became usable.
    ConnectionReady {
        /// The server the connection is for.
        address: ServerAddress,
        /// The pool-local id of the connection.
        connection_id: u32,
    },

    /// A connection was closed.
    ConnectionClosed {
        /// The server the connection was for.
        address: ServerAddress,
        /// The pool-local id of the connection.
        connection_id: u32,
        /// Why the connection was closed.
        reason: ConnectionClosedReason,
    },

    /// A checkout attempt began.
    ConnectionCheckoutStarted {
        /// The server the checkout targets.
        address: ServerAddress,
    },

    /// A checkout attempt failed.
    ConnectionCheckoutFailed {
        /// The server the checkout targeted.
        address: ServerAddress,
        /// Why the checkout failed.
        reason: CheckoutFailedReason,
    },

    /// A connection was checked out.
    ConnectionCheckedOut {
        /// The server the connection is for.
        address: ServerAddress,
        /// The pool-local id of the connection.
        connection_id: u32,
    },

    /// A connection was checked back in.
    ConnectionCheckedIn {
        /// The server the connection is for.
        address: ServerAddress,
        /// The pool-local id of the connection.
        connection_id: u32,
    },
}
