use anyhow::Result;
use clap::Parser;
use tapedeck_collector::{CollectorConfig, serve};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    serve(CollectorConfig::parse()).await
}
