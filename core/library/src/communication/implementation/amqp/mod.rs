//! Broker implementation for AMQP 0-9-1 servers like RabbitMQ, built on [`lapin`]
//!
//! Every channel is put into confirm mode, so a publish only completes once the broker
//! took responsibility for the message.

mod broker;
mod channel;
mod delivery;

pub use broker::AmqpBroker;
pub use channel::AmqpChannel;
pub use delivery::AmqpDelivery;

use thiserror::Error;

/// Errors which are not covered by [`lapin::Error`]
#[derive(Error, Debug)]
pub enum AmqpError {
    /// Broker refused to take responsibility for a published message
    #[error("broker did not confirm message published to '{exchange}' with routing key '{routing_key}'")]
    Nacked {
        /// Exchange the message was published to
        exchange: String,
        /// Routing key the message was published with
        routing_key: String,
    },
}
