//! UDP broadcast discovery for parley servers.
//!
//! A [`DiscoveryServer`] answers scope-tagged probes with the TCP port its
//! session server listens on and periodically announces that port. A
//! [`DiscoveryClient`] probes until it hears a reply in its own scope, then
//! waits until asked to [`rescan`](DiscoveryClient::rescan).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod server;

pub use client::{DiscoveredCallback, DiscoveryClient, ScanState, TimeoutCallback};
pub use config::DiscoveryConfig;
pub use error::{Error, Result};
pub use server::DiscoveryServer;
