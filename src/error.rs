//! Error kinds for the preview proxy, per spec §7.
//!
//! Most of the crate uses `anyhow::Result` at bind/handshake boundaries, matching
//! the teacher's own convention. The dispatcher needs to branch on error *kind*
//! at a couple of points, so those call sites use this dedicated enum instead —
//! kept to exactly the variants something in this crate actually constructs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("could not parse request target: {0}")]
    TargetParseError(String),

    #[error("failed to connect upstream: {0}")]
    UpstreamConnectError(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("exhausted port range starting at {start} (+{attempts} attempts)")]
    BindExhausted { start: u16, attempts: u16 },
}
