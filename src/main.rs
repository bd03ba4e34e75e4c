use clap::Parser;
use ratewarden::config::Config;
use ratewarden::server::Server;

#[derive(Parser, Debug)]
#[command(name = "ratewarden", about = "Distributed token-bucket rate limiter")]
struct Args {
    /// Path to a configuration file (without extension), resolved by the `config` crate.
    #[arg(short, long, default_value = "config")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    tracing::info!(bind_address = %config.bind_address, "starting ratewarden");

    let server = Server::new(config).await?;
    server.run().await
}
