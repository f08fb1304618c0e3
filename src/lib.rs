#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod bson;
mod client;
mod cmap;
mod concern;
pub mod error;
pub mod event;
mod hello;
mod operation;
pub(crate) mod retry;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
#[cfg(feature = "sync")]
pub mod sync;
mod wire;

pub use crate::{
    client::{
        options::{
            ClientOptions,
            Credential,
            MonitoringMode,
            ServerAddress,
            Tls,
            TlsOptions,
        },
        Client,
    },
    concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern},
    selection_criteria::{Predicate, ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};

pub use cmap::ConnectionInfo;
pub use sdam::public::*;

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
