//! # gasmask-server
//!
//! HTTP server library for the gasmask telemetry daemon.
//!
//! This library assembles the pipeline from `gasmask-core` and exposes it
//! through the API handlers and shared state.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod daemon;
#[cfg(feature = "mock-transport")]
pub mod demo;
pub mod logging;
pub mod state;
