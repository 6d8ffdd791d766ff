//! Device connection supervision.
//!
//! The station connects in over TCP. Only one connection is served at a
//! time; each gets a fresh [`LineDecoder`], so a partial line never leaks
//! into the next connection.

use crate::engine::{EngineError, EngineHandle};
use crate::model::{HistoricalRecord, local_now};
use crate::model::timefmt::HANDSHAKE_TIME;
use crate::protocol::{self, LineDecoder, Message};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use time::PrimitiveDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 8 * 1024;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Identifies one device connection for the lifetime of the process.
pub type ConnectionId = u64;

/// The latest reset request. `target` names the connection whose commands
/// caused it; `None` means whichever connection is up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetRequest {
    pub sequence: u64,
    pub target: Option<ConnectionId>,
}

impl ResetRequest {
    pub fn applies_to(&self, connection: ConnectionId) -> bool {
        self.target.is_none_or(|target| target == connection)
    }
}

/// Lets the engine ask for a device connection to be dropped.
/// A request made while no device is connected is not carried over to the
/// next connection, and a request aimed at an earlier connection is ignored.
#[derive(Debug, Clone)]
pub struct ConnectionControl {
    resets: Arc<watch::Sender<ResetRequest>>,
    connections: Arc<AtomicU64>,
}

impl Default for ConnectionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionControl {
    pub fn new() -> Self {
        let (resets, _) = watch::channel(ResetRequest::default());
        Self {
            resets: Arc::new(resets),
            connections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hands out the id for a newly accepted connection.
    pub fn begin_connection(&self) -> ConnectionId {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn request_reset(&self, target: Option<ConnectionId>) {
        self.resets.send_modify(|request| {
            request.sequence += 1;
            request.target = target;
        });
    }

    pub fn resets_requested(&self) -> u64 {
        self.resets.borrow().sequence
    }

    pub fn subscribe(&self) -> watch::Receiver<ResetRequest> {
        self.resets.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    Closed,
    ResetRequested,
    ReadFailed,
    WriteFailed,
    EngineClosed,
    Shutdown,
}

#[derive(Debug)]
pub struct ConnectionSupervisor {
    engine: EngineHandle,
    control: ConnectionControl,
    reconnect_delay: Duration,
    decode_errors: u64,
}

impl ConnectionSupervisor {
    pub fn new(engine: EngineHandle, control: ConnectionControl, reconnect_delay: Duration) -> Self {
        Self {
            engine,
            control,
            reconnect_delay,
            decode_errors: 0,
        }
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    /// Accepts device connections until `shutdown` flips or the engine stops.
    pub async fn run(mut self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?listener.local_addr().ok(), "Waiting for weather station connection");
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "Failed to accept connection");
                    continue;
                }
            };

            info!(%peer, "Weather station connected");
            let outcome = self.serve(stream, &mut shutdown).await;
            info!(%peer, ?outcome, decode_errors = self.decode_errors, "Weather station disconnected");
            if matches!(outcome, Disconnect::Shutdown | Disconnect::EngineClosed) {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("Connection supervisor stopped");
    }

    /// Serves one connection until it closes, fails, or a reset is requested.
    pub async fn serve<T>(&mut self, stream: T, shutdown: &mut watch::Receiver<bool>) -> Disconnect
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut resets = self.control.subscribe();
        let connection = self.control.begin_connection();
        let engine = self.engine.for_connection(connection);
        let mut decoder = LineDecoder::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.changed() => return Disconnect::Shutdown,
                _ = resets.changed() => {
                    let request = *resets.borrow_and_update();
                    if request.applies_to(connection) {
                        warn!(connection, "Dropping connection on collector request");
                        return Disconnect::ResetRequested;
                    }
                    debug!(connection, target = ?request.target, "Ignoring reset for an earlier connection");
                    continue;
                }
                read = reader.read(&mut buffer) => read,
            };
            let count = match read {
                Ok(0) => return Disconnect::Closed,
                Ok(count) => count,
                Err(err) => {
                    warn!(error = %err, "Connection read failed");
                    return Disconnect::ReadFailed;
                }
            };
            decoder.feed(&buffer[..count]);
            if let Err(outcome) = self.dispatch(&engine, &mut decoder, &mut writer).await {
                return outcome;
            }
        }
    }

    /// Forwards every complete line. Historical records from one read are
    /// sent as one batch, flushed before any other message so the engine
    /// sees them in arrival order.
    async fn dispatch<W>(
        &mut self,
        engine: &EngineHandle,
        decoder: &mut LineDecoder,
        writer: &mut W,
    ) -> Result<(), Disconnect>
    where
        W: AsyncWrite + Unpin,
    {
        let mut historical = Vec::new();
        while let Some(line) = decoder.next_line() {
            let message = match line.and_then(|line| protocol::parse_message(&line)) {
                Ok(message) => message,
                Err(err) => {
                    self.decode_errors += 1;
                    warn!(error = %err, "Discarding undecodable message");
                    continue;
                }
            };
            match message {
                Message::Historical(records) => historical.extend(records),
                Message::Initialize => {
                    flush(engine, &mut historical)?;
                    self.reply_initialize(writer).await?;
                }
                other => {
                    flush(engine, &mut historical)?;
                    forward(engine, other).map_err(|_| Disconnect::EngineClosed)?;
                }
            }
        }
        flush(engine, &mut historical)
    }

    async fn reply_initialize<W>(&self, writer: &mut W) -> Result<(), Disconnect>
    where
        W: AsyncWrite + Unpin,
    {
        let since = self
            .engine
            .statistics()
            .last_saved_record_time
            .unwrap_or_else(|| one_year_before(local_now()));
        let reply = match since.format(HANDSHAKE_TIME) {
            Ok(formatted) => formatted,
            Err(err) => {
                error!(error = %err, "Failed to format handshake time");
                return Err(Disconnect::WriteFailed);
            }
        };
        info!(since = %reply, "Answering initialize");
        write_line(writer, &reply).await.map_err(|err| {
            warn!(error = %err, "Failed to answer initialize");
            Disconnect::WriteFailed
        })
    }
}

fn flush(engine: &EngineHandle, historical: &mut Vec<HistoricalRecord>) -> Result<(), Disconnect> {
    if historical.is_empty() {
        return Ok(());
    }
    debug!(records = historical.len(), "Forwarding historical batch");
    engine
        .submit_historical_batch(std::mem::take(historical))
        .map_err(|_| Disconnect::EngineClosed)
}

fn forward(engine: &EngineHandle, message: Message) -> Result<(), EngineError> {
    match message {
        Message::Sensors(sensors) => engine.submit_sensors(sensors),
        Message::SensorStations(stations) => engine.submit_sensor_stations(stations),
        Message::SensorStationStatus(statuses) => engine.submit_sensor_station_status(statuses),
        Message::StationParameters(parameters) => engine.submit_station_parameters(parameters),
        Message::CurrentWeather { weather, raw } => engine.submit_current_weather(weather, raw),
        Message::Historical(records) => engine.submit_historical_batch(records),
        Message::Initialize => Ok(()),
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn one_year_before(now: PrimitiveDateTime) -> PrimitiveDateTime {
    now.replace_year(now.year() - 1)
        .unwrap_or_else(|_| now - time::Duration::days(365))
}
