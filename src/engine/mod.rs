//! External proxy engine control
//!
//! This module provides:
//! - The minimal configuration document a probing session runs on
//! - A typed client for the engine's HTTP control API
//! - Downloading the engine executable when it is missing
//! - A session owning one ephemeral engine subprocess

pub mod client;
pub mod config;
pub mod install;
pub mod session;

pub use client::{DelayProbe, DelayResponse, EngineClient};
pub use config::{EngineConfig, EngineLogLevel, EngineMode};
pub use install::{ensure_engine, DEFAULT_ENGINE_URL};
pub use session::{EngineSession, EngineState};
