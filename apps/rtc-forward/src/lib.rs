pub mod auth;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod forward;
pub mod lifecycle;
pub mod negotiation;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod telemetry;
