mod config;
mod error;
mod limit;
mod model;
mod story;
#[cfg(test)]
mod testing;
mod web;

use std::sync::Arc;

use actix_web::{web::Data, App, HttpServer};
use anyhow::{Context, Result};
use dotenv::dotenv;
use log::info;

use config::Settings;
use limit::RateLimiter;
use model::OllamaClient;
use story::Orchestrator;
use web::routes;

#[actix_web::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let settings = Settings::from_env().context("Invalid configuration")?;
    info!("Starting story service on {}:{}", settings.bind_addr, settings.port);
    info!(
        "Models: primary {}, fallback {}",
        settings.primary_model, settings.fallback_model
    );

    let client = Arc::new(OllamaClient::new(
        &settings.ollama_url,
        &settings.primary_model,
        settings.max_concurrent_requests,
    ));

    let limiter = Arc::new(RateLimiter::from_settings(&settings.rate_limit));
    let sweeper = limiter.spawn_sweeper(settings.rate_limit.sweep_every);

    let orchestrator = Orchestrator::from_settings(&settings, limiter, client.clone())
        .context("Failed to load prompt templates")?;
    let orchestrator = Data::new(orchestrator);

    HttpServer::new(move || {
        App::new()
            .app_data(orchestrator.clone())
            .configure(routes::configure)
    })
    .bind((settings.bind_addr.as_str(), settings.port))
    .with_context(|| format!("Failed to bind {}:{}", settings.bind_addr, settings.port))?
    .run()
    .await?;

    info!("Server stopped, cancelling in-flight generations");
    client.cancel_all();
    sweeper.abort();
    Ok(())
}
