mod cli;
mod commands;
mod output;

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    std::process::exit(commands::dispatch(cli).await);
}
