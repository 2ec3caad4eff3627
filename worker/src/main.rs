use anyhow::Result;
use clap::Parser;

mod args;
mod invoke;
mod lambda;
mod run;
mod serve;
mod trigger;
mod wiring;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    k3ctl_common::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Lambda(args) => lambda::run(args).await,
        Commands::Serve(args) => serve::run(args).await,
        Commands::Invoke(args) => invoke::run(args).await,
    }
}
