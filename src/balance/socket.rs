use super::factory::ClientSocketFactory;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_rustls::client::TlsStream;

/// Byte stream to a backend, plain or TLS.
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl BackendStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            BackendStream::Plain(stream) => stream,
            BackendStream::Tls(stream) => stream.get_ref().0,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, BackendStream::Tls(_))
    }
}

impl fmt::Debug for BackendStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_secure() { "tls" } else { "tcp" };
        match self.peer_addr() {
            Ok(addr) => write!(f, "BackendStream[{}://{}]", kind, addr),
            Err(_) => write!(f, "BackendStream[{}]", kind),
        }
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One live connection to a backend. Owned by a [`ClientSocket`] while
/// active and by the factory's idle ring while idle; dropping it closes the
/// socket.
pub struct PooledConnection {
    id: u64,
    debug_id: String,
    stream: BackendStream,
    pool_sequence_id: u32,
    authenticated: bool,
    last_read_time: Option<Instant>,
    idle_start_time: Option<Instant>,
    active_since: Instant,
}

impl PooledConnection {
    pub(crate) fn new(id: u64, debug_id: String, stream: BackendStream, pool_sequence_id: u32) -> Self {
        Self {
            id,
            debug_id,
            stream,
            pool_sequence_id,
            authenticated: false,
            last_read_time: None,
            idle_start_time: None,
            active_since: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn debug_id(&self) -> &str {
        &self.debug_id
    }

    pub fn pool_sequence_id(&self) -> u32 {
        self.pool_sequence_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn last_read_time(&self) -> Option<Instant> {
        self.last_read_time
    }

    /// When the connection entered the idle ring; `None` while active.
    pub fn idle_start_time(&self) -> Option<Instant> {
        self.idle_start_time
    }

    pub(crate) fn active_since(&self) -> Instant {
        self.active_since
    }

    pub(crate) fn to_active(&mut self) {
        self.idle_start_time = None;
        self.active_since = Instant::now();
    }

    pub(crate) fn to_idle(&mut self, idle_start: Instant) {
        self.idle_start_time = Some(idle_start);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PooledConnection[{}]", self.debug_id)
    }
}

/// A caller's lease on an active backend connection.
///
/// Hand it back with [`ClientSocket::free`] to make it reusable or
/// [`ClientSocket::close`] to discard it. Dropping the lease closes it.
pub struct ClientSocket {
    conn: Option<PooledConnection>,
    factory: Arc<ClientSocketFactory>,
    socket_timeout: Duration,
}

impl ClientSocket {
    pub(crate) fn new(factory: Arc<ClientSocketFactory>, conn: PooledConnection) -> Self {
        let socket_timeout = factory.config().socket_timeout;
        Self {
            conn: Some(conn),
            factory,
            socket_timeout,
        }
    }

    fn conn(&self) -> io::Result<&PooledConnection> {
        self.conn.as_ref().ok_or_else(released)
    }

    fn conn_mut(&mut self) -> io::Result<&mut PooledConnection> {
        self.conn.as_mut().ok_or_else(released)
    }

    pub fn factory(&self) -> &Arc<ClientSocketFactory> {
        &self.factory
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id).unwrap_or_default()
    }

    pub fn debug_id(&self) -> &str {
        self.conn.as_ref().map(|c| c.debug_id.as_str()).unwrap_or("")
    }

    pub fn is_authenticated(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.authenticated)
    }

    /// Mark the connection as having completed backend authentication so a
    /// recycled lease can skip it.
    pub fn set_authenticated(&mut self, authenticated: bool) {
        if let Some(conn) = self.conn.as_mut() {
            conn.authenticated = authenticated;
        }
    }

    pub fn pool_sequence_id(&self) -> u32 {
        self.conn.as_ref().map(|c| c.pool_sequence_id).unwrap_or_default()
    }

    /// False once the backend has been stopped since this connection opened.
    pub fn is_pool_sequence_id_valid(&self) -> bool {
        self.pool_sequence_id() == self.factory.start_sequence_id()
    }

    pub fn last_read_time(&self) -> Option<Instant> {
        self.conn.as_ref().and_then(|c| c.last_read_time)
    }

    pub fn idle_start_time(&self) -> Option<Instant> {
        self.conn.as_ref().and_then(|c| c.idle_start_time)
    }

    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.conn()?.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.conn()?.stream.peer_addr()
    }

    pub fn stream_mut(&mut self) -> io::Result<&mut BackendStream> {
        Ok(&mut self.conn_mut()?.stream)
    }

    /// Read with the backend socket timeout applied.
    pub async fn read_with_timeout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = self.socket_timeout;
        match timeout(limit, self.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out("read", limit)),
        }
    }

    /// Write the whole buffer with the backend socket timeout applied.
    pub async fn write_all_with_timeout(&mut self, buf: &[u8]) -> io::Result<()> {
        let limit = self.socket_timeout;
        match timeout(limit, async {
            self.write_all(buf).await?;
            self.flush().await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(timed_out("write", limit)),
        }
    }

    /// Return the connection for reuse, idle from its last read (or now).
    /// A lease from before the last stop is closed rather than pooled.
    pub fn free(mut self) {
        if let Some(conn) = self.conn.take() {
            self.factory.free(conn, None);
        }
    }

    /// Return the connection for reuse with an explicit idle start.
    pub fn free_at(mut self, idle_start: Instant) {
        if let Some(conn) = self.conn.take() {
            self.factory.free(conn, Some(idle_start));
        }
    }

    /// Discard the connection.
    pub fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            self.factory.close_connection(conn);
        }
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.factory.close_connection(conn);
        }
    }
}

impl fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSocket[{}]", self.debug_id())
    }
}

impl AsyncRead for ClientSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let conn = match self.get_mut().conn.as_mut() {
            Some(conn) => conn,
            None => return Poll::Ready(Err(released())),
        };

        let before = buf.filled().len();
        let poll = Pin::new(&mut conn.stream).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            if buf.filled().len() > before {
                conn.last_read_time = Some(Instant::now());
            }
        }
        poll
    }
}

impl AsyncWrite for ClientSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(&mut conn.stream).poll_write(cx, buf),
            None => Poll::Ready(Err(released())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(&mut conn.stream).poll_flush(cx),
            None => Poll::Ready(Err(released())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(&mut conn.stream).poll_shutdown(cx),
            None => Poll::Ready(Err(released())),
        }
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection already released")
}

fn timed_out(op: &str, limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("backend {} timed out after {:?}", op, limit),
    )
}
