use clap::Parser;

use attest_provider::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    attest_provider::server::run(cli).await
}
