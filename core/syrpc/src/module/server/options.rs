use crate::options::RpcOptions;
use library::communication::rpc::{AckMode, Settings};
use structopt::StructOpt;

/// Options for the server module
#[derive(Debug, StructOpt)]
pub struct Options {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub rpc: RpcOptions,

    /// Keep serving requests instead of exiting after the first one
    #[structopt(long)]
    pub forever: bool,

    /// When to acknowledge requests, either on receipt or on completion.
    /// Requests acknowledged on completion are redelivered if the server dies while processing.
    #[structopt(long, env, default_value = "receipt")]
    pub ack_mode: AckMode,
}

impl Options {
    /// Settings for the server created from these options
    pub fn settings(&self) -> Settings {
        let mut settings = self.rpc.settings();
        settings.ack_mode = self.ack_mode;
        settings
    }
}
