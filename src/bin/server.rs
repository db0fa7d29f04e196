use clap::Parser;
use liquid_frame::error::LiquidError;
use liquid_frame::network::Server;
use liquid_frame::{logging, Settings};
use log::info;

/// The registration server of a `liquid_frame` cluster. Assigns ids to nodes
/// as they join and tells every node who else is a member. Ctrl-C shuts the
/// whole cluster down.
#[derive(Parser)]
#[command(version = "1.0")]
struct Opts {
    /// The IP:Port to listen on
    #[arg(short = 'a', long = "address", default_value = "127.0.0.1:9000")]
    address: String,
    /// A TOML settings file
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), LiquidError> {
    let opts = Opts::parse();
    let settings = Settings::load(opts.config.as_deref())?;
    logging::init(&settings.logging);

    let mut server =
        Server::new(&opts.address, settings.network.max_frame_bytes).await?;
    let kill_notifier = server.kill_notifier();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            kill_notifier.notify_one();
        }
    });
    server.accept_new_connections().await
}
