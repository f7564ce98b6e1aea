//! Mindmap headless driver.
//!
//! Runs a story session against the catalog API with a simulated location
//! and exposes the session controls as `#commands` on stdin:
//!
//! ```bash
//! MINDMAP_API_BASE=https://example.org cargo run -p mindmap -- --lat 51.7534 --lon -1.2540
//! ```

mod headless;
mod provider;

use mindmap_core::CoreConfig;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout stays a clean command protocol
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config = CoreConfig::from_env();
    if config.api_base.is_none() {
        eprintln!("Error: {} environment variable not set.", mindmap_core::config::API_BASE_ENV);
        eprintln!("Please set it in .env file or with: export MINDMAP_API_BASE=https://your-server");
        std::process::exit(1);
    }

    let options = headless::parse_options_from_args(&args);
    headless::run_headless(config, options).await?;
    Ok(())
}

fn print_help() {
    println!("Mindmap - location-gated story map (headless driver)");
    println!();
    println!("USAGE:");
    println!("  mindmap [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help         Show this help message");
    println!("  --lat <LATITUDE>   Starting latitude of the simulated position");
    println!("  --lon <LONGITUDE>  Starting longitude of the simulated position");
    println!("  --deny             Refuse location permission");
    println!();
    println!("ENVIRONMENT:");
    println!("  MINDMAP_API_BASE   Base URL of the story catalog API (required)");
    println!("  MINDMAP_DATA_DIR   Directory for saved progress (default: ./mindmap-data)");
    println!("  RUST_LOG           Log filter (default: info)");
    println!();
    println!("EXAMPLES:");
    println!("  mindmap --lat 51.7534 --lon -1.2540");
    println!("  mindmap --deny");
}
