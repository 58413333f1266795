//! Error types for the transport engine.

/// Errors that can occur across the transport engine.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Session creation**: [`UnsupportedFormat`](Self::UnsupportedFormat),
///   [`InvalidArgument`](Self::InvalidArgument),
///   [`OutOfMemory`](Self::OutOfMemory) — fatal, the session is never built.
/// - **Hot path, transient**: [`Busy`](Self::Busy),
///   [`TryAgain`](Self::TryAgain), [`Timeout`](Self::Timeout) — callers
///   retry; these are counted, not logged per-event.
/// - **Ring discipline**: [`BadState`](Self::BadState) — a slot transition
///   violated the lifecycle diagram; the slot is recycled to `Free`.
/// - **Receive**: [`FrameIncomplete`](Self::FrameIncomplete) — surfaced only
///   when the session opted into incomplete delivery.
/// - **Conversion**: [`ConvertFail`](Self::ConvertFail) — the slot is
///   recycled and the producer re-notified.
/// - **Unrecoverable**: [`Fatal`](Self::Fatal) — the session transitions to
///   `Stopped` and fires a fatal event.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The (surface, wire) format pair is not in the internal converter
    /// table and no registered plugin matched the request.
    #[error("unsupported format conversion: {0}")]
    UnsupportedFormat(String),

    /// Dimensions, fps, packing, or another creation parameter is
    /// inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A frame or packet pool could not be sized at creation time.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// No `Free` slot and the caller requested a non-blocking get, or no
    /// converted frame at the pacer's dequeue point.
    #[error("resource busy")]
    Busy,

    /// The session was stopped; the caller should check its stop flag.
    #[error("session stopped, try again")]
    TryAgain,

    /// A blocking wait exceeded its timeout budget.
    #[error("wait timed out")]
    Timeout,

    /// A frame-slot transition violated the lifecycle state diagram.
    #[error("slot {slot} in state {actual}, expected {expected}")]
    BadState {
        slot: usize,
        expected: &'static str,
        actual: &'static str,
    },

    /// An RX frame is missing packets. Surfaced only when the session was
    /// created with the incomplete-frame delivery flag.
    #[error("frame incomplete: {received}/{expected} packets")]
    FrameIncomplete { received: u32, expected: u32 },

    /// A converter returned failure or a zero-size result.
    #[error("pixel format conversion failed")]
    ConvertFail,

    /// Unrecoverable error; the session becomes `Stopped`.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Whether the error is transient (retry) rather than terminal.
    ///
    /// Transient errors are aggregated into counters instead of being
    /// logged per occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Busy | TransportError::TryAgain | TransportError::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransportError::Busy.is_transient());
        assert!(TransportError::TryAgain.is_transient());
        assert!(TransportError::Timeout.is_transient());
        assert!(!TransportError::ConvertFail.is_transient());
        assert!(!TransportError::Fatal("nic gone".into()).is_transient());
    }

    #[test]
    fn bad_state_message_names_states() {
        let e = TransportError::BadState {
            slot: 2,
            expected: "in_user",
            actual: "free",
        };
        let msg = e.to_string();
        assert!(msg.contains("slot 2"));
        assert!(msg.contains("in_user"));
        assert!(msg.contains("free"));
    }
}
