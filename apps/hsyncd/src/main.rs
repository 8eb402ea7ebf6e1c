use eyre::Result;

mod bridge;
mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run().await
}
