#[macro_use]
extern crate log;

pub mod backoff;
mod bundler;
pub mod client;
pub mod error;
pub mod poller;
pub mod registry;
mod router;
mod runloops;
pub mod subscriptions;
pub mod transport;
pub mod wire;

pub use client::LeashClient;
pub use jsonrpc_core;
pub use leash_types as types;
pub use registry::{SubscriptionHandle, SubscriptionRegistry};
pub use subscriptions::SubscribeRequest;
pub use transport::TungsteniteTransport;
