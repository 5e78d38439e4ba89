//! Game-client transport: frame codec, write serialization, opcode dispatch,
//! request/response correlation, and session lifecycle with reconnection.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod auth;
pub mod connection;
pub mod context;
pub mod correlator;
pub mod diagnostics;
pub mod dispatch;
pub mod framing;
pub mod payload;
pub mod reconnection;
pub mod transport;
pub mod writer;

pub use auth::{AuthError, AuthOpcodes, LoginRequest, LoginResponse, authenticate};
pub use connection::{
    CloseCallback, ConnectionManager, ConnectionState, ConnectionStateWatch, ManagerConfig,
};
pub use context::ClientContext;
pub use correlator::{CorrelationKey, KeyTag, PendingResponse, RequestError};
pub use diagnostics::{DebugEvent, DebugEventKind, Diagnostics, MetricsSnapshot};
pub use dispatch::{DispatchRegistry, SubscriptionId};
pub use framing::{
    ChannelKind, Frame, FrameError, Opcode, StreamReassembler, decode_datagram,
    decode_stream_frames, encode_bounded_stream_frame, encode_datagram, encode_stream_frame,
};
pub use payload::{PayloadError, decode_payload, encode_payload};
pub use reconnection::{ReconnectConfig, ReconnectState};
pub use transport::{
    Connector, DatagramChannel, MemoryConnector, MemoryDatagram, NetConnector, NetConnectorConfig,
    PeerChannels, SessionChannels, UdpChannel, is_transient,
};
pub use writer::{WriteError, WriteSerializer, WriteTicket};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
///
/// Handlers run under `catch_unwind`, so a poisoned lock only means a
/// handler panicked while some unrelated guard was alive.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
