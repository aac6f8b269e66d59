use crate::options::RpcOptions;
use serde_json::Value;
use structopt::StructOpt;

/// Options for the client module
#[derive(Debug, StructOpt)]
pub struct Options {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub rpc: RpcOptions,

    /// Type of the request, servers dispatch on it
    #[structopt(long = "type", env = "REQUEST_TYPE", default_value = "echo")]
    pub kind: String,

    /// JSON payload of the request
    #[structopt(
        long,
        env = "REQUEST_DATA",
        default_value = r#"{"foo":"bar","baz":9001}"#,
        parse(try_from_str = serde_json::from_str)
    )]
    pub data: Value,
}
