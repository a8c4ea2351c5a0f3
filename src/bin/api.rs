use dompet_core::api::{build_state, start_server};
use dompet_core::config::Config;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    dotenv::dotenv().ok();

    let config = Config::from_env();
    if config.auth_secret.is_empty() {
        eprintln!("AUTH_SECRET is not set; bearer tokens cannot be verified.");
        eprintln!("See .env.example for setup instructions.");
        std::process::exit(1);
    }

    let port = config.port;
    let state = build_state(config)?;

    info!("Dompet orchestration core starting");

    start_server(state, port).await
}
