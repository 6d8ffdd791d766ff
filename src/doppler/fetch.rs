use crate::model::DopplerImage;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;
use time::PrimitiveDateTime;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Radar frames are a few hundred kilobytes; anything past this is not an image.
pub const MAX_IMAGE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
    #[error("http status {0}")]
    Http(u16),
    #[error("response larger than {MAX_IMAGE_BYTES} bytes")]
    TooLarge,
    #[error("empty response body")]
    Empty,
    #[error("image decode error: {0}")]
    Decode(#[from] image::ImageError),
}

/// Where doppler frames come from. Implementations block; the poller calls
/// them from the blocking pool.
pub trait ImageSource: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetches frames over `http://` or `https://`.
#[derive(Debug, Clone)]
pub struct HttpImageSource {
    agent: ureq::Agent,
}

impl Default for HttpImageSource {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl HttpImageSource {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self { agent }
    }
}

impl ImageSource for HttpImageSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        validate_url(url)?;
        let response = match self.agent.get(url).set("Accept", "image/*").call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => return Err(FetchError::Http(code)),
            Err(ureq::Error::Transport(transport)) => {
                return Err(FetchError::Transport(transport.to_string()));
            }
        };

        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_IMAGE_BYTES + 1)
            .read_to_end(&mut body)
            .map_err(FetchError::Io)?;
        if body.len() as u64 > MAX_IMAGE_BYTES {
            return Err(FetchError::TooLarge);
        }
        if body.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(body)
    }
}

/// Accepts `http://` and `https://` URLs with a non-empty host.
pub fn validate_url(url: &str) -> Result<(), FetchError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| FetchError::InvalidUrl("only http:// and https:// are supported".to_string()))?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = match authority.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>()
                .map_err(|_| FetchError::InvalidUrl("invalid port".to_string()))?;
            host
        }
        None => authority,
    };
    if host.is_empty() {
        return Err(FetchError::InvalidUrl("missing host".to_string()));
    }
    Ok(())
}

/// Decodes fetched bytes into RGBA pixels, keeping the original bytes.
pub fn decode_image(encoded: Vec<u8>, time: PrimitiveDateTime) -> Result<DopplerImage, FetchError> {
    if encoded.is_empty() {
        return Err(FetchError::Empty);
    }
    let pixels = image::load_from_memory(&encoded)?.to_rgba8();
    Ok(DopplerImage {
        time,
        width: pixels.width(),
        height: pixels.height(),
        pixels: pixels.into_raw(),
        encoded,
    })
}
