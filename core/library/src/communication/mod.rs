//! Structures to exchange requests and results between services through a message broker
//!
//! There are two parties involved:
//!
//! - Requesting side, the [`Client`](rpc::Client)
//! - Responding side, the [`Server`](rpc::Server)
//!
//! A client tags every request with a freshly generated correlation identifier and publishes
//! it onto a single request queue shared by all servers of an application. A server picks up
//! one request at a time and publishes the result onto a result exchange. Results are spread
//! over a fixed number of shard queues. The shard is derived from the correlation identifier by a keyed hash,
//! thus both parties agree on it without any coordination. A client waiting on a shard may
//! observe results addressed to other clients that happen to hash to the same shard. Those are
//! handed back to the broker untouched so that their rightful recipient can pick them up.
//!
//! The broker itself is abstracted by the traits in the [`broker`] module. An AMQP based
//! implementation is provided in the [`implementation`] module.

mod error;

pub mod broker;
pub mod implementation;
pub mod rpc;

pub use error::RpcError;
