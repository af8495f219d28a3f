//! # Call Relay
//!
//! Bridges one telephony call to one realtime speech-agent session.
//!
//! ## Key Components:
//! - **protocol**: wire messages on both sides and the transfer tool contract
//! - **session**: per-call state (id, phase, transcript, peer handles)
//! - **registry**: every live call, keyed by call id, capped at `max_concurrent_calls`
//! - **agent**: the agent WebSocket client behind the `AgentConnector` seam
//! - **transfer**: delayed, deduplicated transfer webhooks
//! - **transcript**: post-call transcript persistence
//! - **orchestrator**: the per-call pumps and teardown
//!
//! ## Data Flow:
//! ```text
//! carrier --8kHz--> upsample --24kHz--> agent
//! carrier <--8kHz-- downsample+fade <--24kHz-- agent
//! ```

pub mod agent;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transcript;
pub mod transfer;

