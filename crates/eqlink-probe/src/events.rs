//! Debug event logging.

use eqlink_net::{DebugEvent, DebugEventKind};
use tokio::sync::broadcast;

/// One-line summary of an event.
pub fn summarize(kind: &DebugEventKind) -> String {
    match kind {
        DebugEventKind::State(state) => format!("state -> {state:?}"),
        DebugEventKind::Sent {
            channel,
            opcode,
            len,
        } => format!("sent {opcode} on {channel} ({len} bytes)"),
        DebugEventKind::Received {
            channel,
            opcode,
            len,
        } => format!("received {opcode} on {channel} ({len} bytes)"),
        DebugEventKind::DecodeFailed {
            channel,
            opcode: Some(opcode),
            error,
        } => format!("decode of {opcode} on {channel} failed: {error}"),
        DebugEventKind::DecodeFailed {
            channel,
            opcode: None,
            error,
        } => format!("undecodable frame on {channel}: {error}"),
        DebugEventKind::HandlerPanicked {
            channel,
            opcode,
            message,
        } => format!("handler for {opcode} on {channel} panicked: {message}"),
        DebugEventKind::CorrelationMiss { opcode, key } => {
            format!("response {opcode} matched no request (key {key})")
        }
        DebugEventKind::RequestTimedOut { opcode } => {
            format!("request waiting for {opcode} timed out")
        }
        DebugEventKind::TransientError { channel, error } => {
            format!("recoverable error on {channel}: {error}")
        }
    }
}

/// Log events until the bus closes.
pub async fn log_events(mut events: broadcast::Receiver<DebugEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                tracing::info!(target: "eqlink_probe::events", "{}", summarize(&event.kind));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "debug event logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eqlink_net::{ChannelKind, ConnectionState};

    #[test]
    fn test_summaries() {
        assert_eq!(
            summarize(&DebugEventKind::State(ConnectionState::Reconnecting)),
            "state -> Reconnecting"
        );
        assert_eq!(
            summarize(&DebugEventKind::Sent {
                channel: ChannelKind::Reliable,
                opcode: 5,
                len: 12
            }),
            "sent 5 on stream (12 bytes)"
        );
        assert_eq!(
            summarize(&DebugEventKind::DecodeFailed {
                channel: ChannelKind::Unreliable,
                opcode: None,
                error: "frame too short".into()
            }),
            "undecodable frame on datagram: frame too short"
        );
        assert_eq!(
            summarize(&DebugEventKind::CorrelationMiss {
                opcode: 6,
                key: "6#3".into()
            }),
            "response 6 matched no request (key 6#3)"
        );
        assert_eq!(
            summarize(&DebugEventKind::TransientError {
                channel: ChannelKind::Unreliable,
                error: "connection refused".into()
            }),
            "recoverable error on datagram: connection refused"
        );
    }
}
