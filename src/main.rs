use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tideslot::config::Config;
use tideslot::engine::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    tideslot::observability::init(config.metrics_port);

    let engine = Engine::from_config(&config);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("tideslot listening on {addr}");
    info!("  commerce: {}", config.commerce_url.as_deref().unwrap_or("not configured"));
    info!("  content: {}", config.content_url.as_deref().unwrap_or("not configured"));
    info!(
        "  pages: {} x {} (timeout {:?})",
        config.fetch.max_pages, config.fetch.page_size, config.fetch.page_timeout
    );
    info!("  prefetch: {}", if config.prefetch { "enabled" } else { "disabled" });
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, let in-flight requests finish
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        info!("shutdown signal received, draining requests");
    };

    axum::serve(listener, tideslot::http::router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("tideslot stopped");
    Ok(())
}
