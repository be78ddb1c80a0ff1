use clap::Parser;
use pushfan_server::ServerBuilder;
use pushfan_server::config::loader::{DEFAULT_CONFIG_PATH, load_config};

#[derive(Debug, Parser)]
#[command(name = "pushfan-server", version, about = "Web push fan-out server")]
struct Cli {
    /// Configuration file
    #[arg(long, env = "PUSHFAN_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    // Initialize tracing early with the default level
    pushfan_server::init_tracing();

    let cli = Cli::parse();

    let cfg = match load_config(Some(&cli.config)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(path = %cli.config, "Configuration loaded");
    pushfan_server::apply_logging_level(&cfg.logging.level);

    let server = match ServerBuilder::new().with_config(cfg).build().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Server initialization failed: {e:#}");
            std::process::exit(2);
        }
    };

    if let Err(err) = server.run().await {
        eprintln!("Server error: {err:#}");
        std::process::exit(1);
    }
}
