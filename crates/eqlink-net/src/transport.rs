//! Channel establishment.
//!
//! A [`Connector`] performs the handshake and returns both channels of a
//! session at once: a datagram channel and the two halves of a reliable
//! byte stream. [`NetConnector`] uses TCP for the reliable channel and a
//! connected UDP socket for datagrams. [`MemoryConnector`] hands out
//! in-process channels and gives the test side the matching peer ends.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, mpsc};

/// Largest datagram the UDP channel will ever read.
const MAX_UDP_PACKET: usize = 65_535;

/// Boxed read half of the reliable channel.
pub type StreamReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of the reliable channel.
pub type StreamWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Unordered, best-effort message channel.
pub trait DatagramChannel: Send + Sync + 'static {
    /// Send one datagram. Oversized datagrams fail with an I/O error.
    fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next datagram. Errors other than the ones
    /// [`is_transient`] accepts end the channel.
    fn recv(&self) -> impl Future<Output = io::Result<Vec<u8>>> + Send;
}

/// Whether a datagram receive error leaves the channel usable.
///
/// A connected UDP socket reports an ICMP port-unreachable for an earlier
/// send as `ConnectionRefused` (or `ConnectionReset` on Windows) on the next
/// receive. The socket itself is still fine.
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Both channels of one freshly established session.
pub struct SessionChannels<D> {
    /// Unreliable channel.
    pub datagram: D,
    /// Read half of the reliable channel.
    pub reader: StreamReader,
    /// Write half of the reliable channel.
    pub writer: StreamWriter,
}

/// Performs the session handshake.
pub trait Connector: Send + Sync + 'static {
    /// Datagram channel type produced by this connector.
    type Datagram: DatagramChannel;

    /// Open both channels to `address:port`.
    fn connect(
        &self,
        address: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<SessionChannels<Self::Datagram>>> + Send;
}

// ---------------------------------------------------------------------------
// TCP + UDP
// ---------------------------------------------------------------------------

/// Configuration for [`NetConnector`].
#[derive(Debug, Clone)]
pub struct NetConnectorConfig {
    /// Upper bound on the whole handshake. Default: 5 s.
    pub connect_timeout: Duration,
    /// Largest datagram the channel accepts for sending. Default: 1200 bytes.
    pub max_datagram_size: usize,
}

impl Default for NetConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_datagram_size: 1200,
        }
    }
}

/// Connects a TCP stream and a UDP socket to the same server endpoint.
///
/// The client always opens the reliable stream; the server accepts it.
#[derive(Debug, Clone, Default)]
pub struct NetConnector {
    config: NetConnectorConfig,
}

impl NetConnector {
    /// Create a connector with the given configuration.
    pub fn new(config: NetConnectorConfig) -> Self {
        Self { config }
    }

    async fn handshake(&self, address: &str, port: u16) -> io::Result<SessionChannels<UdpChannel>> {
        let peer = tokio::net::lookup_host((address, port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address for {address}:{port}"),
                )
            })?;

        let stream = TcpStream::connect(peer).await?;
        stream.set_nodelay(true)?;

        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;

        let (reader, writer) = stream.into_split();
        Ok(SessionChannels {
            datagram: UdpChannel::new(socket, self.config.max_datagram_size),
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

impl Connector for NetConnector {
    type Datagram = UdpChannel;

    async fn connect(&self, address: &str, port: u16) -> io::Result<SessionChannels<UdpChannel>> {
        tokio::time::timeout(self.config.connect_timeout, self.handshake(address, port))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("handshake with {address}:{port} timed out"),
                )
            })?
    }
}

/// Datagram channel over a connected UDP socket.
pub struct UdpChannel {
    socket: UdpSocket,
    max_datagram_size: usize,
    /// Receive buffer, reused across datagrams.
    recv_buf: Mutex<Vec<u8>>,
}

impl UdpChannel {
    fn new(socket: UdpSocket, max_datagram_size: usize) -> Self {
        Self {
            socket,
            max_datagram_size,
            recv_buf: Mutex::new(vec![0u8; MAX_UDP_PACKET]),
        }
    }
}

impl DatagramChannel for UdpChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        if datagram.len() > self.max_datagram_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "datagram of {} bytes exceeds limit of {}",
                    datagram.len(),
                    self.max_datagram_size
                ),
            ));
        }
        self.socket.send(datagram).await.map(|_| ())
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        let mut buf = self.recv_buf.lock().await;
        let n = self.socket.recv(&mut buf).await?;
        Ok(buf[..n].to_vec())
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// One end of an in-process datagram pair.
pub struct MemoryDatagram {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryDatagram {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

impl DatagramChannel for MemoryDatagram {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "datagram peer closed"))
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "datagram peer closed"))
    }
}

/// Server side of an in-process session.
pub struct PeerChannels {
    /// Address the client asked for.
    pub address: String,
    /// Port the client asked for.
    pub port: u16,
    /// Peer end of the datagram channel.
    pub datagram: MemoryDatagram,
    /// Peer end of the reliable stream.
    pub stream: DuplexStream,
}

struct MemoryShared {
    peers: mpsc::UnboundedSender<PeerChannels>,
    refusing: AtomicBool,
    attempts: AtomicU32,
    handshake_delay_ms: AtomicU64,
    buffer: usize,
}

/// In-process connector. Every successful connect delivers a
/// [`PeerChannels`] to the receiver returned by [`MemoryConnector::new`].
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<MemoryShared>,
}

impl MemoryConnector {
    /// Create a connector and the receiver of accepted sessions.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerChannels>) {
        Self::with_buffer(64 * 1024)
    }

    /// Like [`new`](Self::new) with a custom duplex buffer size, useful for
    /// forcing partial reads.
    pub fn with_buffer(buffer: usize) -> (Self, mpsc::UnboundedReceiver<PeerChannels>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MemoryShared {
            peers,
            refusing: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            handshake_delay_ms: AtomicU64::new(0),
            buffer,
        });
        (Self { shared }, rx)
    }

    /// Make subsequent handshakes fail (or succeed again).
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Make each handshake take `delay` before it completes.
    pub fn set_handshake_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.shared.handshake_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of handshakes attempted so far.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    type Datagram = MemoryDatagram;

    async fn connect(
        &self,
        address: &str,
        port: u16,
    ) -> io::Result<SessionChannels<MemoryDatagram>> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = Duration::from_millis(self.shared.handshake_delay_ms.load(Ordering::SeqCst));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.shared.refusing.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{address}:{port} refused"),
            ));
        }

        let (client_stream, peer_stream) = tokio::io::duplex(self.shared.buffer);
        let (client_datagram, peer_datagram) = MemoryDatagram::pair();
        self.shared
            .peers
            .send(PeerChannels {
                address: address.to_string(),
                port,
                datagram: peer_datagram,
                stream: peer_stream,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no peer listening"))?;

        let (reader, writer) = tokio::io::split(client_stream);
        Ok(SessionChannels {
            datagram: client_datagram,
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}
