//! Weather station telemetry collector.
//!
//! Bytes from the station are decoded by [`protocol`], forwarded by the
//! [`supervisor`] and applied one command at a time by the [`engine`], which
//! drives [`storm`] tracking and [`summary`] recomputation against a
//! [`store::WeatherStore`]. The [`doppler`] poller feeds radar frames into
//! the same queue.

pub mod api;
pub mod command;
pub mod config;
pub mod doppler;
pub mod engine;
pub mod error;
pub mod model;
pub mod protocol;
pub mod state;
pub mod storm;
pub mod store;
pub mod summary;
pub mod supervisor;
