use crate::engine::EngineHandle;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Latest raw current-weather payload seen on the live feed.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveWeather {
    pub payload: Arc<str>,
    pub received: SystemTime,
}

/// Shared state behind the HTTP surface. Collector state itself stays on the
/// engine task; this only holds handles and the live-feed cache.
#[derive(Debug)]
pub struct AppState {
    engine: EngineHandle,
    live_weather: Option<LiveWeather>,
    doppler_url: watch::Sender<Option<String>>,
}

impl AppState {
    pub fn new(engine: EngineHandle, doppler_url: Option<String>) -> Self {
        let (doppler_url, _) = watch::channel(doppler_url);
        Self {
            engine,
            live_weather: None,
            doppler_url,
        }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn live_weather(&self) -> Option<&LiveWeather> {
        self.live_weather.as_ref()
    }

    pub fn set_live_weather(&mut self, payload: Arc<str>, received: SystemTime) {
        self.live_weather = Some(LiveWeather { payload, received });
    }

    pub fn doppler_url(&self) -> Option<String> {
        self.doppler_url.borrow().clone()
    }

    /// The poller reads the URL through this on every tick.
    pub fn subscribe_doppler_url(&self) -> watch::Receiver<Option<String>> {
        self.doppler_url.subscribe()
    }

    pub fn set_doppler_url(&mut self, url: Option<String>) {
        self.doppler_url.send_replace(url);
    }
}

/// Copies every live current-weather payload into `state` until the feed closes.
pub fn spawn_live_weather_task(
    state: Arc<RwLock<AppState>>,
    mut feed: broadcast::Receiver<Arc<str>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(payload) => match state.write() {
                    Ok(mut guard) => guard.set_live_weather(payload, SystemTime::now()),
                    Err(_) => {
                        warn!("State lock poisoned while storing current weather");
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Live weather feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
