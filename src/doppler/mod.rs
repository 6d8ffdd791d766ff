//! Doppler radar polling.
//!
//! Runs beside the engine on its own interval. The change cache belongs to
//! the poller alone; only new frames reach the engine queue.

use crate::engine::EngineHandle;
use crate::model::local_now;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub mod cache;
pub mod fetch;

pub use cache::ImageChangeCache;
pub use fetch::{FetchError, HttpImageSource, ImageSource};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_CACHE_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    NoUrl,
    FetchFailed,
    Unchanged,
    Submitted,
    EngineClosed,
}

pub struct DopplerPoller {
    source: Arc<dyn ImageSource>,
    engine: EngineHandle,
    url: watch::Receiver<Option<String>>,
    cache: ImageChangeCache,
    interval: Duration,
}

impl std::fmt::Debug for DopplerPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DopplerPoller")
            .field("url", &*self.url.borrow())
            .field("cached", &self.cache.len())
            .field("interval", &self.interval)
            .finish()
    }
}

impl DopplerPoller {
    /// `url` may be changed at any time; the next tick uses the new value.
    pub fn new(
        source: Arc<dyn ImageSource>,
        engine: EngineHandle,
        url: watch::Receiver<Option<String>>,
        interval: Duration,
        cache_size: usize,
    ) -> Self {
        Self {
            source,
            engine,
            url,
            cache: ImageChangeCache::new(cache_size),
            interval,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "Doppler poller started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if self.poll_once().await == PollOutcome::EngineClosed {
                        break;
                    }
                }
            }
        }
        info!("Doppler poller stopped");
    }

    /// One fetch. Failures are logged and wait for the next tick.
    pub async fn poll_once(&mut self) -> PollOutcome {
        let Some(url) = self.url.borrow().clone() else {
            return PollOutcome::NoUrl;
        };
        let source = Arc::clone(&self.source);
        let time = local_now();
        let fetched = tokio::task::spawn_blocking(move || {
            let encoded = source.fetch(&url)?;
            fetch::decode_image(encoded, time)
        })
        .await;

        let image = match fetched {
            Ok(Ok(image)) => image,
            Ok(Err(err)) => {
                warn!(error = %err, "Doppler fetch failed");
                return PollOutcome::FetchFailed;
            }
            Err(err) => {
                warn!(error = %err, "Doppler fetch task failed");
                return PollOutcome::FetchFailed;
            }
        };

        if !self.cache.observe(&image) {
            debug!("Doppler image unchanged");
            return PollOutcome::Unchanged;
        }
        match self.engine.submit_doppler_image(image) {
            Ok(()) => PollOutcome::Submitted,
            Err(err) => {
                warn!(error = %err, "Doppler image not submitted");
                PollOutcome::EngineClosed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{self, EngineSettings};
    use crate::store::MemoryStore;
    use crate::supervisor::ConnectionControl;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Vec<u8>, FetchError>>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<u8>, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    impl ImageSource for ScriptedSource {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .unwrap_or(Err(FetchError::Empty))
        }
    }

    fn png(shade: u8) -> Vec<u8> {
        let frame = image::RgbaImage::from_pixel(4, 4, image::Rgba([shade, shade, shade, 255]));
        let mut encoded = Vec::new();
        image::DynamicImage::ImageRgba8(frame)
            .write_to(&mut Cursor::new(&mut encoded), image::ImageFormat::Png)
            .expect("encode png");
        encoded
    }

    #[tokio::test]
    async fn only_changed_frames_reach_the_engine() -> Result<(), Box<dyn std::error::Error>> {
        let (handle, worker) = engine::spawn(
            MemoryStore::new(),
            EngineSettings::default(),
            ConnectionControl::new(),
        )?;
        let source = ScriptedSource::new(vec![
            Ok(png(1)),
            Ok(png(1)),
            Err(FetchError::Http(503)),
            Ok(b"<html>oops</html>".to_vec()),
            Ok(png(2)),
            Ok(png(1)),
        ]);
        let (_url_tx, url) = watch::channel(Some("http://radar.example/latest.png".to_string()));
        let mut poller = DopplerPoller::new(source, handle.clone(), url, DEFAULT_INTERVAL, 3);

        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(poller.poll_once().await);
        }

        assert_eq!(
            outcomes,
            vec![
                PollOutcome::Submitted,
                PollOutcome::Unchanged,
                PollOutcome::FetchFailed,
                PollOutcome::FetchFailed,
                PollOutcome::Submitted,
                PollOutcome::Unchanged,
            ]
        );
        handle.barrier().await?;
        assert_eq!(handle.statistics().doppler_images_saved, 2);
        handle.shutdown();
        let store = worker.await?;
        assert_eq!(store.doppler_images().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn missing_url_skips_the_fetch() -> Result<(), Box<dyn std::error::Error>> {
        let (handle, worker) = engine::spawn(
            MemoryStore::new(),
            EngineSettings::default(),
            ConnectionControl::new(),
        )?;
        let source = ScriptedSource::new(vec![Ok(png(1))]);
        let (url_tx, url) = watch::channel(None);
        let mut poller = DopplerPoller::new(source, handle.clone(), url, DEFAULT_INTERVAL, 1);

        assert_eq!(poller.poll_once().await, PollOutcome::NoUrl);
        url_tx.send_replace(Some("http://radar.example/latest.png".to_string()));
        assert_eq!(poller.poll_once().await, PollOutcome::Submitted);

        handle.shutdown();
        let _ = worker.await?;
        Ok(())
    }
}
