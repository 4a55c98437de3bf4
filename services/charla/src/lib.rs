//! Charla Service Library Crate
//!
//! Wires the session core to the WebRTC transport and the host's audio
//! devices, and drives one voice session from the terminal. The `charla`
//! binary is a thin wrapper around this library.

pub mod app;
pub mod cli;
pub mod config;
