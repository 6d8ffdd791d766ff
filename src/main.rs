use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;
use weather_collector::config::{self, Config};
use weather_collector::doppler::{DopplerPoller, HttpImageSource};
use weather_collector::engine;
use weather_collector::error::AppError;
use weather_collector::state::{self, AppState};
use weather_collector::store::{MemoryStore, SqliteStore, WeatherStore};
use weather_collector::supervisor::{ConnectionControl, ConnectionSupervisor};
use weather_collector::api;

fn init_tracing(level: &str) -> Result<(), AppError> {
    let level: tracing::Level = level
        .trim()
        .parse()
        .map_err(|_| AppError::LogLevel(level.to_string()))?;
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config_path = config::config_path();
    let config = config::load_default()?;
    init_tracing(&config.logging.level)?;
    tracing::info!(
        config_path = %config_path.display(),
        app = %config.app.name,
        "weather-collector starting"
    );

    match config.storage_path() {
        Some(path) => {
            let store = SqliteStore::open(path)?;
            run(config, store).await
        }
        None => {
            tracing::warn!("No [storage].path configured, data is kept in memory only");
            run(config, MemoryStore::new()).await
        }
    }
}

async fn run<S>(config: Config, mut store: S) -> Result<(), AppError>
where
    S: WeatherStore + 'static,
{
    store.register_weather_station(config.station_name())?;

    let control = ConnectionControl::new();
    let (engine, worker) = engine::spawn(store, config.engine_settings(), control.clone())?;

    let app_state = AppState::new(engine.clone(), config.doppler_url().map(str::to_string));
    let doppler_url = app_state.subscribe_doppler_url();
    let app_state = Arc::new(RwLock::new(app_state));
    let live_feed =
        state::spawn_live_weather_task(Arc::clone(&app_state), engine.subscribe_current_weather());

    let (stop, shutdown) = watch::channel(false);

    let station_addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port()));
    let station_listener = TcpListener::bind(station_addr).await?;
    tracing::info!(%station_addr, "Station listener bound");
    let supervisor = tokio::spawn(
        ConnectionSupervisor::new(engine.clone(), control, config.reconnect_delay())
            .run(station_listener, shutdown.clone()),
    );

    if doppler_url.borrow().is_none() {
        tracing::info!("No doppler url configured, poller idle until one is set");
    }
    let poller = tokio::spawn(
        DopplerPoller::new(
            Arc::new(HttpImageSource::new(config.doppler_timeout())),
            engine.clone(),
            doppler_url,
            config.doppler_interval(),
            config.doppler_cache_size(),
        )
        .run(shutdown.clone()),
    );

    let app = api::router(Arc::clone(&app_state));
    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.server_port()));
    let api_listener = TcpListener::bind(api_addr).await?;
    tracing::info!(%api_addr, "API server listening");
    let mut api_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(api_listener, app)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    stop.send_replace(true);
    supervisor.await?;
    poller.await?;
    engine.shutdown();
    let _store = worker.await?;
    live_feed.abort();
    server.await??;

    tracing::info!("weather-collector stopped");
    Ok(())
}
