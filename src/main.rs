use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "otelbridge")]
#[command(about = "Bridge HTTP/JSON APIs into OpenTelemetry metrics and logs", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file (falls back to $SCRAPER_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.or_else(|| {
        std::env::var("SCRAPER_CONFIG")
            .ok()
            .map(PathBuf::from)
    });
    let Some(config_path) = config_path else {
        eprintln!("Error: no configuration file given");
        eprintln!("Use --config <path> or set SCRAPER_CONFIG.");
        std::process::exit(1);
    };

    match otelbridge::cli::run(config_path).await {
        Ok(()) => {}
        Err(e) if e.is_config_error() => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    }
}
