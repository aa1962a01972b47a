//! # Turnstile Server
//!
//! Actix-web server with per-identity admission control in front of its
//! routes.

use actix_web::{App, HttpServer, web};
use anyhow::Context;
use tracing_actix_web::TracingLogger;

mod config;
mod handlers;
mod middleware;
mod state;
mod telemetry;

use config::AppConfig;
use middleware::AdmissionMiddleware;
use state::AppState;
use telemetry::TelemetryConfig;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    telemetry::init_telemetry(&TelemetryConfig::from_env());

    let config = AppConfig::from_env().context("invalid configuration")?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        store = config.store.backend_name(),
        ip_limit = config.admission.limits.per_ip,
        token_limit = config.admission.limits.per_token,
        window_secs = config.engine.window.as_secs(),
        block_secs = config.engine.block_duration.as_secs(),
        "Starting Turnstile server"
    );

    let state = AppState::new(&config)
        .await
        .context("counter store unavailable")?;
    let admission = AdmissionMiddleware::new(state.engine.clone(), config.admission.clone());

    HttpServer::new(move || {
        let admission = admission.clone();
        App::new()
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(move |cfg| handlers::configure_routes(cfg, admission))
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}
