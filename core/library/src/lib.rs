//! Independent and project agnostic building blocks for request/response messaging
//!
//! The [`communication`] module contains the correlation protocol which allows a client
//! to publish a request onto a message broker and wait for exactly the one result addressed
//! to it, while a server consumes those requests and publishes the results back. Everything
//! broker specific is hidden behind the traits in [`communication::broker`] so that the
//! protocol can run against AMQP in production and an in-memory broker in tests.

#![deny(missing_docs)]
// Disable the lint for now as it has a high false-positive rate
#![allow(unknown_lints, clippy::nonstandard_macro_braces)]

pub mod communication;
pub mod helpers;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
