use anyhow::Result;
use harness::ModuleRunner;
use module::client::Requester;
use module::server::EchoServer;
use options::{Command, LogFormat};
use structopt::StructOpt;
use tracing::info;

mod module;
mod options;

#[tokio::main]
async fn main() -> Result<()> {
    let (command, runner) = init()?;

    let reason = match command {
        Command::Client(options) => runner.run(Requester::new(options)).await,
        Command::Server(options) => runner.run(EchoServer::new(options)).await,
    };

    if reason.is_failure() {
        std::process::exit(1);
    }

    Ok(())
}

fn init() -> Result<(Command, ModuleRunner)> {
    let options = options::MainOptions::from_args();

    let formatter = tracing_subscriber::fmt().with_env_filter(options.log);

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    info!("SyRPC {}", env!("CARGO_PKG_VERSION"));

    Ok((options.command, ModuleRunner::default()))
}
