//! Default values and naming patterns shared with other implementations of the protocol

use std::time::Duration;

/// Character encoding announced in the message properties
pub const ENCODING: &str = "utf-8";

/// Default time in seconds to wait for a request or result
pub const TIMEOUT: Duration = Duration::from_secs(30);

/// Default AMQP virtual host
pub const VIRTUALHOST: &str = "/";

/// Default AMQP port
pub const DEFAULT_PORT: u16 = 5672;

/// Default AMQP credentials
pub const DEFAULT_CREDENTIALS: &str = "guest";

/// Idle time after which the broker deletes an unused result queue
pub const QUEUE_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Time after which an unclaimed result is dropped by the broker
pub const MESSAGE_TTL: Duration = Duration::from_secs(10);

/// Default number of result queues
pub const NUM_QUEUES: usize = 64;

/// Default key for hashing correlation identifiers onto result queues.
/// Must be identical for all clients and servers of an application.
pub const HASH_KEY: &str = "EdaeYa6eesh3ahSh";

/// Content type of all messages
pub const CONTENT_TYPE: &str = "application/json";

/// Suffix of the request exchange, queue and routing key
pub const REQUEST_SUFFIX: &str = "_request";

/// Suffix of the result exchange
pub const RESULT_EXCHANGE_SUFFIX: &str = "_result_exchange";

/// Infix between the application name and the shard index of result queues
pub const RESULT_QUEUE_INFIX: &str = "_result_queue_";

/// Number of unacknowledged results a waiting client may hold at once
///
/// Results addressed to other clients are held while waiting, so a client skips at most
/// this many of them before it can see its own.
pub const RESULT_PREFETCH: u16 = 16;

/// Time after which held results addressed to other clients are handed back to the broker
pub const RESULT_RELEASE_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound for returning results buffered by a cancelled consumer
pub const RESULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
