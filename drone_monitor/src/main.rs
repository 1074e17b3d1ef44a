use drone_monitor::{config, start_app};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::get_configuration().expect("failed to load config");
    let log_level = &format!("{},hyper=info,reqwest=info", config.log_level.as_str());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_level(true))
        .init();

    tracing::info!(
        "Monitoring defaults: {} mode, {}ms cadence, classifier at {}",
        config.monitoring.mode.as_str(),
        config.monitoring.cadence_ms,
        config.classifier.base_url
    );
    start_app(config).await?;

    Ok(())
}
