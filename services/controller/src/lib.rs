//! steward controller.
//!
//! This crate primarily ships a `steward-controller` binary, but exposes a
//! small library surface for integration testing and reuse.

pub mod api;
pub mod config;
pub mod manifest;
pub mod state;
