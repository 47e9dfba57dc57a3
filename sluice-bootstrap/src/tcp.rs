use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use sluice::{Handler, IdleStatus, IoSink, Message, Session, SessionId, WriteRequest};
use sluice_pool::{LeaderFollowersPool, PoolBuilder, PoolStats, WorkSource};

use crate::error::BootstrapError;

/// Sets up a new session's filter chain before any event is fired.
pub type ChainInitializer = Box<dyn Fn(&Arc<Session>) -> sluice::Result<()> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The [`IoSink`] of a TCP session: writes encoded messages to the socket and
/// fires `Sent` once a write has completed.
///
/// Accepts [`Bytes`], [`BytesMut`], `Vec<u8>`, `String` and `&'static str`
/// payloads; anything else fails the write.
pub struct TcpSink {
    stream: Mutex<TcpStream>,
    peer_addr: SocketAddr,
}

impl TcpSink {
    /// Wraps a handle to a connected stream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            stream: Mutex::new(stream),
            peer_addr,
        })
    }
}

fn payload(message: &Message) -> Option<&[u8]> {
    if let Some(bytes) = message.downcast_ref::<Bytes>() {
        Some(&bytes[..])
    } else if let Some(bytes) = message.downcast_ref::<BytesMut>() {
        Some(&bytes[..])
    } else if let Some(bytes) = message.downcast_ref::<Vec<u8>>() {
        Some(bytes.as_slice())
    } else if let Some(text) = message.downcast_ref::<String>() {
        Some(text.as_bytes())
    } else {
        message
            .downcast_ref::<&'static str>()
            .map(|text| text.as_bytes())
    }
}

impl IoSink for TcpSink {
    fn write(&self, session: &Arc<Session>, request: WriteRequest) -> io::Result<()> {
        let Some(data) = payload(request.message()) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot write a {} to a socket", request.message().type_name()),
            ));
        };
        lock(&self.stream).write_all(data)?;
        trace!("stream write {} bytes to {}", data.len(), self.peer_addr);

        if let Err(err) = session.fire_sent(request.original_message().clone()) {
            trace!("session {} sent not delivered: {}", session.id(), err);
        }
        Ok(())
    }

    fn close(&self, session: &Arc<Session>) {
        debug!("session {} closing {}", session.id(), self.peer_addr);
        if let Err(err) = lock(&self.stream).shutdown(Shutdown::Both) {
            trace!("shutdown of {} failed: {}", self.peer_addr, err);
        }
    }
}

impl fmt::Debug for TcpSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSink")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// A factory that can be used to configure and start a [`TcpServer`].
pub struct TcpServerBuilder {
    name: String,
    max_pool_size: usize,
    keep_alive: Option<Duration>,
    read_buffer_size: usize,
    idle_time: Option<Duration>,
    initializer: Option<ChainInitializer>,
    handler: Option<Arc<dyn Handler>>,
}

impl Default for TcpServerBuilder {
    fn default() -> Self {
        Self {
            name: String::from("sluice-tcp"),
            max_pool_size: 16,
            keep_alive: Some(Duration::from_secs(60)),
            read_buffer_size: 2048, // Typical internet MTU = 1500, rounded up to a power of 2
            idle_time: None,
            initializer: None,
            handler: None,
        }
    }
}

impl TcpServerBuilder {
    /// Creates a new TcpServerBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the server's threads.
    pub fn name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    /// Upper bound on server threads. Each open connection occupies one.
    pub fn max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    /// How long an idle server thread waits before exiting.
    pub fn keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Size of the per-connection read buffer.
    pub fn read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size.max(1);
        self
    }

    /// Fires `Idle(ReaderIdle)` whenever nothing has been read for this long.
    pub fn idle_time(mut self, idle_time: Option<Duration>) -> Self {
        self.idle_time = idle_time.filter(|d| !d.is_zero());
        self
    }

    /// Sets up each new session's filter chain.
    pub fn chain<F>(mut self, initializer: F) -> Self
    where
        F: Fn(&Arc<Session>) -> sluice::Result<()> + Send + Sync + 'static,
    {
        self.initializer = Some(Box::new(initializer));
        self
    }

    /// The handler every session delivers to.
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Binds to `addr` and starts accepting.
    pub fn bind<A: ToSocketAddrs>(self, addr: A) -> Result<TcpServer, BootstrapError> {
        let handler = self.handler.ok_or(BootstrapError::MissingHandler)?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let acceptor = Acceptor {
            listener,
            local_addr,
            stopping: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            read_buffer_size: self.read_buffer_size,
            idle_time: self.idle_time,
            initializer: self.initializer,
            handler,
        };
        let pool = PoolBuilder::new()
            .name(&self.name)
            .max_pool_size(self.max_pool_size)
            .keep_alive(self.keep_alive)
            .build(acceptor)?;
        info!("{} listening on {}", self.name, local_addr);
        Ok(TcpServer { pool })
    }
}

/// The accept socket a leader blocks on, plus everything needed to serve a
/// connection once accepted.
struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    stopping: AtomicBool,
    connections: Mutex<HashMap<SessionId, TcpStream>>,
    read_buffer_size: usize,
    idle_time: Option<Duration>,
    initializer: Option<ChainInitializer>,
    handler: Arc<dyn Handler>,
}

impl Acceptor {
    fn wake_address(&self) -> SocketAddr {
        match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.local_addr.port())
            }
            IpAddr::V6(ip) if ip.is_unspecified() => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), self.local_addr.port())
            }
            _ => self.local_addr,
        }
    }

    fn stop(&self) {
        let connections = lock(&self.connections);
        if !self.stopping.swap(true, Ordering::AcqRel) {
            debug!("closing {} open connection(s)", connections.len());
        }
        for stream in connections.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn open(&self, stream: &TcpStream) -> io::Result<Arc<Session>> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let sink = TcpSink::new(stream.try_clone()?)?;
        let session = Session::builder(Arc::clone(&self.handler), Arc::new(sink))
            .local_addr(local_addr)
            .remote_addr(peer_addr)
            .build();

        if let Some(initializer) = &self.initializer {
            initializer(&session).map_err(io::Error::other)?;
        }

        let mut connections = lock(&self.connections);
        if self.stopping.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "server is stopping",
            ));
        }
        connections.insert(session.id(), stream.try_clone()?);
        Ok(session)
    }

    fn serve(&self, mut stream: TcpStream) {
        let session = match self.open(&stream) {
            Ok(session) => session,
            Err(err) => {
                warn!("dropping connection: {}", err);
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        };
        debug!(
            "session {} accepted from {:?}",
            session.id(),
            session.remote_addr()
        );

        let mut buf = vec![0u8; self.read_buffer_size];
        if let Err(err) = stream.set_read_timeout(self.idle_time) {
            warn!("session {} cannot set idle time: {}", session.id(), err);
        }
        if fire(&session, session.fire_created()) && fire(&session, session.fire_opened()) {
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        trace!("session {} eof", session.id());
                        break;
                    }
                    Ok(n) => {
                        trace!("stream read {} bytes", n);
                        let message = Message::new(Bytes::copy_from_slice(&buf[..n]));
                        if !fire(&session, session.fire_received(message)) {
                            break;
                        }
                    }
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        if !fire(&session, session.fire_idle(IdleStatus::ReaderIdle)) {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        warn!("stream read error {}", err);
                        break;
                    }
                }
            }
        }

        let _ = stream.shutdown(Shutdown::Both);
        fire(&session, session.fire_closed());
        lock(&self.connections).remove(&session.id());
        trace!("tcp connection on {:?} is gracefully down", session.remote_addr());
    }
}

fn fire(session: &Arc<Session>, outcome: sluice::Result<()>) -> bool {
    match outcome {
        Ok(()) => true,
        Err(err) => {
            debug!("session {} stopped reading: {}", session.id(), err);
            false
        }
    }
}

impl WorkSource for Acceptor {
    type Work = TcpStream;

    fn next_work(&self) -> Option<TcpStream> {
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return None;
            }
            match self.listener.accept() {
                Ok(_) if self.stopping.load(Ordering::Acquire) => return None,
                Ok((stream, _)) => return Some(stream),
                Err(err) => warn!("listener accept error {}", err),
            }
        }
    }

    fn run(&self, stream: TcpStream) {
        self.serve(stream);
    }

    fn interrupt(&self) {
        self.stop();
        // Unblocks a leader sitting in accept().
        let _ = TcpStream::connect_timeout(&self.wake_address(), Duration::from_millis(100));
    }
}

/// A blocking TCP server whose accept loop runs on a leader/followers pool.
///
/// The leader blocks in `accept`; once a connection arrives it promotes a
/// successor and serves the connection itself until the peer goes away.
/// Each connection gets a [`Session`] that sees `Created`, `Opened`, any
/// number of `Received` (as [`Bytes`]) and `Idle`, then `Closed` exactly once.
pub struct TcpServer {
    pool: LeaderFollowersPool<Acceptor>,
}

impl TcpServer {
    /// Starts building a server.
    pub fn builder() -> TcpServerBuilder {
        TcpServerBuilder::new()
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.pool.source().local_addr
    }

    /// Open connections.
    pub fn connections(&self) -> usize {
        lock(&self.pool.source().connections).len()
    }

    /// Counters of the underlying pool.
    pub fn stats(&self) -> &PoolStats {
        self.pool.stats()
    }

    /// Stops accepting, closes every open connection and waits for the
    /// server threads to exit. Idempotent.
    pub fn stop(&self) {
        self.pool.source().stop();
        self.pool.shutdown();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connections())
            .field("pool", &self.pool)
            .finish()
    }
}
