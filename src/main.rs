use std::process;
use std::sync::Arc;

use raffica::engine::{Engine, HostHub, PolicyPersistence};
use raffica::fetch::HttpFetcher;
use raffica::{config, proxy, telemetry};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

type StartupError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_startup_error(error.as_ref());
        process::exit(1);
    }
}

fn report_startup_error(error: &(dyn std::error::Error + Send + Sync)) {
    if dispatcher::has_been_set() {
        error!(error = %error, "startup error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "startup error");
    });
}

async fn run() -> Result<(), StartupError> {
    let (_cli, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    let engine = Arc::new(
        Engine::new(
            settings.engine.env.clone(),
            HostHub::global(),
            Arc::new(HttpFetcher::new()),
            PolicyPersistence::Dir(settings.engine.data_dir.clone()),
        )
        .await,
    );

    if engine.is_bypass() {
        info!("running in bypass mode: requests are forwarded without caching");
    }
    engine.activate().await;

    let listener = tokio::net::TcpListener::bind(settings.server.listen).await?;
    info!(listen = %settings.server.listen, "raffica proxy listening");

    let app = proxy::router(engine.clone());
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install shutdown signal handler");
    }
    info!("shutdown signal received");
}
