use std::error::Error;

use tracing::{error, info};

mod cmdline;
mod commands;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = cmdline::root_cli().get_matches();
    match cli.subcommand() {
        Some(("lag", args)) => commands::lag_command(args).await?,
        Some(("cat", args)) => commands::cat_command(args).await?,
        Some(("position", args)) => commands::position_command(args).await?,
        Some(("run", args)) => commands::run_command(args).await?,
        other => return Err(format!("unknown command {:?}", other.map(|(name, _)| name)).into()),
    }
    Ok(())
}
