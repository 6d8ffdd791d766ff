//! Device wire protocol.
//!
//! Newline delimited ASCII. A line is either a bare token (`initialize`) or
//! `<tag> <json>`, where the JSON is one object or an array of them.

use crate::model::{
    CurrentWeather, HistoricalRecord, Sensor, SensorStation, SensorStationStatus,
    WeatherStationParameters,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Longest line kept while waiting for its terminator.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

pub const TAG_SENSOR: &str = "sensor";
pub const TAG_HISTORICAL: &str = "historical";
pub const TAG_CURRENT_WEATHER: &str = "current-weather";
pub const TAG_STATION_PARAMETERS: &str = "weather-station-parameters";
pub const TAG_SENSOR_STATION: &str = "sensor-station";
pub const TAG_SENSOR_STATION_STATUS: &str = "sensor-station-status";

const INITIALIZE: &str = "initialize";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line is not valid utf-8")]
    Utf8,
    #[error("line exceeded {0} bytes without a terminator")]
    LineTooLong(usize),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("unknown payload tag `{0}`")]
    UnknownTag(String),
    #[error("invalid `{tag}` payload: {source}")]
    Json {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Initialize,
    Sensors(Vec<Sensor>),
    Historical(Vec<HistoricalRecord>),
    /// `raw` is the payload exactly as received, for republishing.
    CurrentWeather {
        weather: CurrentWeather,
        raw: String,
    },
    StationParameters(WeatherStationParameters),
    SensorStations(Vec<SensorStation>),
    SensorStationStatus(Vec<SensorStationStatus>),
}

/// Splits a byte stream into lines. One decoder per connection; bytes of a
/// partial line stay buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    overflowed: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_LINE_LENGTH && !self.buffer.contains(&b'\n') {
            self.buffer.clear();
            self.overflowed = true;
        }
    }

    /// Next complete, non-blank line with any trailing `\r` removed.
    pub fn next_line(&mut self) -> Option<Result<String, DecodeError>> {
        if self.overflowed {
            self.overflowed = false;
            return Some(Err(DecodeError::LineTooLong(MAX_LINE_LENGTH)));
        }
        loop {
            let end = self.buffer.iter().position(|byte| *byte == b'\n')?;
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(String::from_utf8(line).map_err(|_| DecodeError::Utf8));
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

fn decode<T: DeserializeOwned>(tag: &str, json: &str) -> Result<T, DecodeError> {
    serde_json::from_str(json).map_err(|source| DecodeError::Json {
        tag: tag.to_string(),
        source,
    })
}

fn decode_list<T: DeserializeOwned>(tag: &str, json: &str) -> Result<Vec<T>, DecodeError> {
    decode::<OneOrMany<T>>(tag, json).map(Vec::from)
}

pub fn parse_message(line: &str) -> Result<Message, DecodeError> {
    let line = line.trim();
    let Some((tag, json)) = line.split_once(char::is_whitespace) else {
        return match line {
            INITIALIZE => Ok(Message::Initialize),
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        };
    };
    let json = json.trim_start();
    match tag {
        TAG_SENSOR => decode_list(tag, json).map(Message::Sensors),
        TAG_HISTORICAL => decode_list(tag, json).map(Message::Historical),
        TAG_CURRENT_WEATHER => Ok(Message::CurrentWeather {
            weather: decode(tag, json)?,
            raw: json.to_string(),
        }),
        TAG_STATION_PARAMETERS => decode(tag, json).map(Message::StationParameters),
        TAG_SENSOR_STATION => decode_list(tag, json).map(Message::SensorStations),
        TAG_SENSOR_STATION_STATUS => decode_list(tag, json).map(Message::SensorStationStatus),
        other => Err(DecodeError::UnknownTag(other.to_string())),
    }
}
