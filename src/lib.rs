//! Zigbee state bridge library.
//!
//! Keeps the last-known state of every Zigbee entity, coalesces bursty
//! device reports, rate-limits publishing and delivers merged state to the
//! MQTT bus.

pub mod config;
pub mod error;
pub mod input;
pub mod instance_lock;
pub mod options;
pub mod pipeline;
pub mod publish;
pub mod state;
pub mod transport;
