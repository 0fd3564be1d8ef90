use tracing::{error, info};

use intake_module::{run_server, ServerError, ServiceConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {}", err);
            std::process::exit(1);
        }
    };

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", err);
        }
        info!("shutdown signal received");
    };

    match run_server(config, shutdown).await {
        Ok(()) => {}
        Err(err @ ServerError::Bind { .. }) => {
            error!("{}", err);
            std::process::exit(2);
        }
        Err(err @ ServerError::Healthcheck(_)) => {
            error!("{}", err);
            std::process::exit(3);
        }
        Err(err) => {
            error!("{}", err);
            std::process::exit(1);
        }
    }
}
