mod cli;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use kizuna_p2p::NodeIdentity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = kizuna_node::config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => kizuna_node::node::run(config).await,
        Commands::Identity => print_identity(&config),
        Commands::Config => {
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn print_identity(config: &kizuna_node::NodeConfig) -> anyhow::Result<()> {
    let identity = NodeIdentity::load_or_create(&config.data_dir())?;
    println!("public key: {}", identity.public_key_hex());
    println!("short id:   {}", identity.short_id());
    Ok(())
}

/// `KIZUNA_LOG` (or `RUST_LOG`) controls the filter; `--verbose` forces
/// debug-level output to stderr.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("KIZUNA_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
