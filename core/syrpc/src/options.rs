//! Command line options shared by all modules
//!
//! Options taking a value may alternatively be provided through an environment variable named
//! after the option, e.g. `AMQ_HOST` for `--amq-host`.

use crate::module::client::Options as ClientOptions;
use crate::module::server::Options as ServerOptions;
use library::communication::rpc::constants::{DEFAULT_CREDENTIALS, ENCODING, HASH_KEY, VIRTUALHOST};
use library::communication::rpc::Settings;
use library::helpers::parse_seconds;
use std::str::FromStr;
use std::time::Duration;
use structopt::StructOpt;
use thiserror::Error;

#[derive(Debug, StructOpt)]
#[structopt(
    about = "Request and response on top of an AMQP message broker.",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct MainOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        global = true,
        default_value = "info,lapin=warn",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,

    /// Output format of log messages
    ///
    /// Formats: text, compact, json
    #[structopt(long, global = true, default_value = "text", env, value_name = "format")]
    pub log_format: LogFormat,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Publishes a request and waits for its result
    Client(ClientOptions),
    /// Answers echo requests
    Server(ServerOptions),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

#[derive(Debug, Error)]
#[error("unknown log format '{0}', expected 'text', 'compact' or 'json'")]
pub struct UnknownLogFormat(String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(UnknownLogFormat(s.to_owned())),
        }
    }
}

/// Options for connecting to the message broker and naming the exchanges and queues
#[derive(Debug, StructOpt)]
pub struct RpcOptions {
    /// Name of the application, prefix of all exchanges and queues
    #[structopt(long, env, default_value = "syrpc")]
    pub app_name: String,

    /// Hostname of the message broker
    #[structopt(long, env, default_value = "localhost")]
    pub amq_host: String,

    /// Port of the message broker
    #[structopt(long, env, default_value = "5672")]
    pub amq_port: u16,

    /// Virtual host on the message broker
    #[structopt(long, env, default_value = VIRTUALHOST)]
    pub amq_virtualhost: String,

    /// Username for the message broker
    #[structopt(long, env, default_value = DEFAULT_CREDENTIALS)]
    pub amq_user: String,

    /// Password for the message broker
    #[structopt(long, env, default_value = DEFAULT_CREDENTIALS, hide_env_values = true)]
    pub amq_password: String,

    /// Seconds after which unused result queues are deleted by the broker
    #[structopt(long, env, default_value = "10800", parse(try_from_str = parse_seconds))]
    pub amq_ttl: Duration,

    /// Seconds after which unclaimed results are dropped by the broker
    #[structopt(long, env, default_value = "10", parse(try_from_str = parse_seconds))]
    pub amq_msg_ttl: Duration,

    /// Number of result queues. Has to be identical for all clients and servers.
    #[structopt(long, env, default_value = "64")]
    pub amq_num_queues: usize,

    /// Key for distributing results over the result queues, exactly 16 bytes.
    /// Has to be identical for all clients and servers.
    #[structopt(long, env, default_value = HASH_KEY, hide_env_values = true)]
    pub amq_hash_key: String,

    /// Encoding announced in the message properties
    #[structopt(long, env, default_value = ENCODING)]
    pub msg_encoding: String,

    /// Seconds to wait for a request or result
    #[structopt(long, env, default_value = "30", parse(try_from_str = parse_seconds))]
    pub timeout: Duration,

    /// Publish results on the request exchange, as releases prior to the
    /// dedicated result exchange did
    #[structopt(long)]
    pub legacy_result_exchange: bool,
}

impl RpcOptions {
    /// Settings for clients and servers created from these options
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::new(&self.app_name, &self.amq_host);

        settings.amq_port = self.amq_port;
        settings.amq_virtualhost = self.amq_virtualhost.clone();
        settings.amq_user = self.amq_user.clone();
        settings.amq_password = self.amq_password.clone();
        settings.amq_ttl = self.amq_ttl;
        settings.amq_msg_ttl = self.amq_msg_ttl;
        settings.amq_num_queues = self.amq_num_queues;
        settings.hash_key = self.amq_hash_key.clone();
        settings.msg_encoding = self.msg_encoding.clone();
        settings.timeout = self.timeout;
        settings.legacy_result_exchange = self.legacy_result_exchange;

        settings
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use library::communication::rpc::constants::{DEFAULT_PORT, NUM_QUEUES};
    use library::communication::rpc::AckMode;
    use pretty_assertions::assert_eq;

    #[test]
    fn fall_back_to_defaults() {
        let options = MainOptions::from_iter_safe(["syrpc", "client"]).unwrap();

        let settings = match options.command {
            Command::Client(client) => client.rpc.settings(),
            _ => panic!("parsed wrong subcommand"),
        };

        assert_eq!(settings.app_name, "syrpc");
        assert_eq!(settings.amq_host, "localhost");
        assert_eq!(settings.amq_port, DEFAULT_PORT);
        assert_eq!(settings.amq_num_queues, NUM_QUEUES);
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert!(!settings.legacy_result_exchange);
        assert_eq!(settings.validate(), Ok(()));
    }

    #[test]
    fn parse_server_options() {
        let options = MainOptions::from_iter_safe([
            "syrpc",
            "--log-format",
            "json",
            "server",
            "--forever",
            "--ack-mode",
            "completion",
            "--app-name",
            "billing",
            "--amq-num-queues",
            "16",
            "--timeout",
            "5",
            "--legacy-result-exchange",
        ])
        .unwrap();

        assert_eq!(options.log_format, LogFormat::Json);

        let server = match options.command {
            Command::Server(server) => server,
            _ => panic!("parsed wrong subcommand"),
        };
        let settings = server.settings();

        assert!(server.forever);
        assert_eq!(settings.ack_mode, AckMode::OnCompletion);
        assert_eq!(settings.app_name, "billing");
        assert_eq!(settings.amq_num_queues, 16);
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert!(settings.legacy_result_exchange);
        assert_eq!(settings.names().result_exchange, "billing_request");
    }

    #[test]
    fn reject_unknown_values() {
        assert!(MainOptions::from_iter_safe(["syrpc", "--log-format", "xml", "client"]).is_err());
        assert!(MainOptions::from_iter_safe(["syrpc", "server", "--ack-mode", "never"]).is_err());
        assert!(MainOptions::from_iter_safe(["syrpc", "client", "--timeout", "soon"]).is_err());
    }
}
