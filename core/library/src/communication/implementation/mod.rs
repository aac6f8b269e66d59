//! Implementations of the broker traits using third-party crates

pub mod amqp;

#[cfg(any(test, feature = "test"))]
pub mod mock;
