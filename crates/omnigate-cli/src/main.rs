use std::process::ExitCode;

use clap::Parser;

use omnigate_cli::{init_tracing, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    Cli::parse().run().await
}
