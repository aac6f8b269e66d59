use super::constants::*;
use super::shard::{ShardSelector, HASH_KEY_LENGTH};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const MAX_TTL_MILLIS: u32 = u32::MAX;

/// Reasons why [`Settings`] may be rejected
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    /// Application name is used to derive all exchange and queue names
    #[error("application name must not be empty")]
    EmptyAppName,
    /// Broker host is mandatory
    #[error("broker host must not be empty")]
    EmptyHost,
    /// Results have to go somewhere
    #[error("number of result queues must be at least one")]
    NoResultQueues,
    /// SipHash requires a key of exactly 16 bytes
    #[error("hash key must be exactly {HASH_KEY_LENGTH} bytes long, got {0}")]
    InvalidHashKey(usize),
    /// Waiting for zero seconds is not waiting at all
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    /// Queue arguments carry whole milliseconds in 32 bits and the broker refuses zero
    #[error("{0} must be at least one millisecond and at most {MAX_TTL_MILLIS} milliseconds")]
    InvalidTtl(&'static str),
    /// Unknown acknowledgement mode literal
    #[error("unknown acknowledgement mode '{0}', expected 'receipt' or 'completion'")]
    UnknownAckMode(String),
}

/// Point in time at which a server acknowledges a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// As soon as it has been received. Requests are lost if processing fails.
    OnReceipt,
    /// Once a result has been published. Abandoned requests are redelivered.
    OnCompletion,
}

impl Default for AckMode {
    fn default() -> Self {
        Self::OnReceipt
    }
}

impl FromStr for AckMode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "receipt" => Ok(Self::OnReceipt),
            "completion" => Ok(Self::OnCompletion),
            _ => Err(SettingsError::UnknownAckMode(s.to_owned())),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnReceipt => write!(f, "receipt"),
            Self::OnCompletion => write!(f, "completion"),
        }
    }
}

/// Configuration shared by clients and servers of an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Name of the application, used as a prefix for all exchanges and queues
    pub app_name: String,
    /// Hostname of the broker
    pub amq_host: String,
    /// Port of the broker
    pub amq_port: u16,
    /// Virtual host on the broker
    pub amq_virtualhost: String,
    /// Username for the broker
    pub amq_user: String,
    /// Password for the broker
    pub amq_password: String,
    /// Idle time after which unused result queues are deleted by the broker
    pub amq_ttl: Duration,
    /// Time after which unclaimed results are dropped by the broker
    pub amq_msg_ttl: Duration,
    /// Number of result queues
    pub amq_num_queues: usize,
    /// Encoding announced in the message properties
    pub msg_encoding: String,
    /// Default time to wait for requests and results
    pub timeout: Duration,
    /// Key for hashing correlation identifiers onto result queues
    pub hash_key: String,
    /// Publish results on the request exchange like earlier releases did
    pub legacy_result_exchange: bool,
    /// When servers acknowledge requests
    pub ack_mode: AckMode,
}

impl Settings {
    /// Creates settings for the given application and broker using defaults for everything else
    pub fn new(app_name: impl Into<String>, amq_host: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            amq_host: amq_host.into(),
            amq_port: DEFAULT_PORT,
            amq_virtualhost: VIRTUALHOST.to_owned(),
            amq_user: DEFAULT_CREDENTIALS.to_owned(),
            amq_password: DEFAULT_CREDENTIALS.to_owned(),
            amq_ttl: QUEUE_TTL,
            amq_msg_ttl: MESSAGE_TTL,
            amq_num_queues: NUM_QUEUES,
            msg_encoding: ENCODING.to_owned(),
            timeout: TIMEOUT,
            hash_key: HASH_KEY.to_owned(),
            legacy_result_exchange: false,
            ack_mode: AckMode::default(),
        }
    }

    /// Checks that the settings can be used to set up a topology
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.app_name.trim().is_empty() {
            return Err(SettingsError::EmptyAppName);
        }

        if self.amq_host.trim().is_empty() {
            return Err(SettingsError::EmptyHost);
        }

        if self.timeout.is_zero() {
            return Err(SettingsError::ZeroTimeout);
        }

        for (name, ttl) in [("amq_ttl", self.amq_ttl), ("amq_msg_ttl", self.amq_msg_ttl)] {
            let millis = ttl.as_millis();
            if millis == 0 || millis > u128::from(MAX_TTL_MILLIS) {
                return Err(SettingsError::InvalidTtl(name));
            }
        }

        self.shard_selector().map(|_| ())
    }

    /// Builds the selector distributing correlation identifiers over the result queues
    pub fn shard_selector(&self) -> Result<ShardSelector, SettingsError> {
        let count = NonZeroUsize::new(self.amq_num_queues).ok_or(SettingsError::NoResultQueues)?;

        let key: [u8; HASH_KEY_LENGTH] = self
            .hash_key
            .as_bytes()
            .try_into()
            .map_err(|_| SettingsError::InvalidHashKey(self.hash_key.len()))?;

        Ok(ShardSelector::new(key, count))
    }

    /// Names of all exchanges and queues derived from the application name
    pub fn names(&self) -> TopologyNames {
        let request = format!("{}{}", self.app_name, REQUEST_SUFFIX);

        let result_exchange = if self.legacy_result_exchange {
            request.clone()
        } else {
            format!("{}{}", self.app_name, RESULT_EXCHANGE_SUFFIX)
        };

        TopologyNames {
            app_name: self.app_name.clone(),
            request_exchange: request.clone(),
            request_queue: request.clone(),
            request_routing_key: request,
            result_exchange,
        }
    }
}

/// Names of the exchanges and queues used by an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNames {
    app_name: String,
    /// Exchange requests are published to
    pub request_exchange: String,
    /// Queue servers consume requests from
    pub request_queue: String,
    /// Routing key binding the request queue to the request exchange
    pub request_routing_key: String,
    /// Exchange results are published to
    pub result_exchange: String,
}

impl TopologyNames {
    /// Name of the result queue for the given shard
    pub fn result_queue(&self, shard: usize) -> String {
        format!("{}{}{}", self.app_name, RESULT_QUEUE_INFIX, shard)
    }
}
