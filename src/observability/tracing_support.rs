//! Tracing integration for structured logging and spans.

use crate::memory::Ownership;
use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create spans around resource creation.
    pub create_spans: bool,
    /// Whether to create spans around ownership transfers.
    pub transfer_spans: bool,
    /// Default span level.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            create_spans: true,
            transfer_spans: true,
            level: Level::DEBUG,
        }
    }
}

impl TracingConfig {
    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            create_spans: false,
            transfer_spans: false,
            level: Level::DEBUG,
        }
    }

    /// Enter a creation span if enabled.
    pub(crate) fn enter_create(&self, backend: &'static str, size: usize) -> Option<tracing::span::EnteredSpan> {
        self.create_spans.then(|| span_create(backend, size).entered())
    }

    /// Enter a transfer span if enabled.
    pub(crate) fn enter_transfer(
        &self,
        backend: &'static str,
        op: &'static str,
    ) -> Option<tracing::span::EnteredSpan> {
        self.transfer_spans
            .then(|| span_transfer(backend, op).entered())
    }
}

/// Create a span for resource creation.
#[inline]
pub fn span_create(backend: &'static str, size: usize) -> Span {
    span!(Level::DEBUG, "create", backend = backend, size = size)
}

/// Create a span for an ownership transfer (`acquire`, `release`, `sync`).
#[inline]
pub fn span_transfer(backend: &'static str, op: &'static str) -> Span {
    span!(Level::DEBUG, "transfer", backend = backend, op = op)
}

/// Log an ownership state change.
#[inline]
pub fn trace_transition(op: &'static str, from: Ownership, to: Ownership, transferred: bool) {
    tracing::debug!(
        op = op,
        from = ?from,
        to = ?to,
        transferred = transferred,
        "ownership transition"
    );
}
