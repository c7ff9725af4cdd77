use hemmer_provider_strava::{init_logging, serve, StravaProvider};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Strava provider");
    serve(StravaProvider::new()).await
}
