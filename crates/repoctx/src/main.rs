use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = repoctx::cli::Cli::parse();
    repoctx::cli::run(cli).await
}
