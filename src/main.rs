use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use msg_relay::proxy::{build_router, AppState, Settings};

#[derive(Parser)]
#[command(name = "msg-relay")]
#[command(author, version, about = "Anthropic-to-OpenAI chat proxy", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address, overriding the config file
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut settings = if cli.config.exists() {
        Settings::from_yaml_file(&cli.config)?
    } else {
        log::warn!(
            "config file {} not found, starting with defaults",
            cli.config.display()
        );
        Settings::default()
    };
    if let Some(listen) = cli.listen {
        settings.listen = listen;
    }

    // Secrets may come from the environment instead of the config file.
    if settings.big_model.api_key.is_empty() {
        if let Ok(key) = std::env::var("BIG_MODEL_API_KEY") {
            settings.big_model.api_key = key;
        }
    }
    if settings.small_model.api_key.is_empty() {
        if let Ok(key) = std::env::var("SMALL_MODEL_API_KEY") {
            settings.small_model.api_key = key;
        }
    }
    if settings.correction.api_key.is_empty() {
        if let Ok(key) = std::env::var("CORRECTION_API_KEY") {
            settings.correction.api_key = key;
        }
    }

    let listen = settings.listen.clone();
    let state = Arc::new(AppState::new(Arc::new(settings))?);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("proxy listening on {}", listen);
    axum::serve(listener, router).await?;

    Ok(())
}
