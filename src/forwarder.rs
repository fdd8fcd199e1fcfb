//! DNS forwarding server.
//!
//! One receive thread owns the listening socket's poll loop. Every datagram
//! it reads is handed to a new query thread, which forwards the bytes to the
//! upstream resolver and sends the reply back to the client. Query threads
//! share nothing with each other.

#[cfg(feature = "logging")]
use crate::log::{debug, error, info, trace};
use crate::{
    dns_parser::{DnsHeader, DnsMessage, FLAGS_QR_RESPONSE, FLAGS_RD, RCODE_SERVFAIL},
    error::{Error, Result},
};
use flume::{bounded, Receiver, Sender};
use mio::{net::UdpSocket as MioUdpSocket, Events, Interest, Poll, Token, Waker};
use socket2::Socket;
use std::{
    collections::HashMap,
    fmt, io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

/// Listening address used when an empty string is given.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:53";

/// Upstream resolver used when an empty string is given.
pub const DEFAULT_UPSTREAM: &str = "8.8.8.8:53";

/// Deadline for one upstream round trip, covering both the send and the reply.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the receive loop wakes up to check whether it should stop.
/// This is not a protocol timeout.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Max size of a datagram, both from clients and from the upstream.
/// Anything larger is treated as malformed.
pub const MAX_MSG_SIZE: usize = 1024;

/// Default max number of query threads running at the same time. Datagrams
/// arriving while all slots are taken are dropped.
pub const MAX_IN_FLIGHT_QUERIES: usize = 256;

const LISTEN_SOCK_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Lifecycle state of a [DnsForwarder].
#[derive(Debug, PartialEq, Clone, Copy, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Different counters included in the metrics.
#[derive(Hash, Eq, PartialEq)]
enum Counter {
    QueryReceived,
    QueryDropped,
    UpstreamOk,
    UpstreamFailure,
    ResponseSent,
    ResponseSendFailure,
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::QueryReceived => write!(f, "query-received"),
            Self::QueryDropped => write!(f, "query-dropped"),
            Self::UpstreamOk => write!(f, "upstream-ok"),
            Self::UpstreamFailure => write!(f, "upstream-failure"),
            Self::ResponseSent => write!(f, "response-sent"),
            Self::ResponseSendFailure => write!(f, "response-send-failure"),
        }
    }
}

/// The metrics is a HashMap of (name_key, i64_value).
/// The main purpose is to help monitoring the relayed traffic.
pub type Metrics = HashMap<String, i64>;

/// The state shared by the API handle, the receive thread and query threads.
///
/// The lock is only held to read or swap these fields, never across network I/O.
struct Inner {
    state: ServerState,

    /// The listening socket, shared with query threads for sending replies.
    socket: Option<Arc<MioUdpSocket>>,

    /// Wakes up the receive loop when stopping.
    waker: Option<Arc<Waker>>,

    /// Disconnected once the receive loop has exited.
    exit_r: Option<Receiver<()>>,

    local_addr: Option<SocketAddr>,

    /// Query threads not finished yet. Not reset by `clear`, as threads
    /// from an earlier run still count themselves out.
    in_flight: usize,
}

impl Inner {
    fn clear(&mut self) {
        self.state = ServerState::Stopped;
        self.socket = None;
        self.waker = None;
        self.exit_r = None;
        self.local_addr = None;
    }
}

/// A DNS forwarder relaying UDP queries to one upstream resolver.
///
/// This struct is a handle to the server and is cloneable. All clones control
/// the same server.
#[derive(Clone)]
pub struct DnsForwarder {
    listen_addr: String,
    upstream_addr: String,
    max_in_flight: usize,
    inner: Arc<Mutex<Inner>>,
    counters: Arc<Mutex<Metrics>>,
}

impl DnsForwarder {
    /// Creates a stopped forwarder. No socket is opened until [DnsForwarder::start].
    ///
    /// An empty `listen_addr` means [DEFAULT_LISTEN], an empty `upstream_addr`
    /// means [DEFAULT_UPSTREAM]. An address without a host, e.g. ":5353",
    /// listens on all IPv4 interfaces.
    pub fn new(listen_addr: &str, upstream_addr: &str) -> Self {
        let listen_addr = if listen_addr.is_empty() {
            DEFAULT_LISTEN
        } else {
            listen_addr
        };
        let upstream_addr = if upstream_addr.is_empty() {
            DEFAULT_UPSTREAM
        } else {
            upstream_addr
        };

        Self {
            listen_addr: listen_addr.to_string(),
            upstream_addr: upstream_addr.to_string(),
            max_in_flight: MAX_IN_FLIGHT_QUERIES,
            inner: Arc::new(Mutex::new(Inner {
                state: ServerState::Stopped,
                socket: None,
                waker: None,
                exit_r: None,
                local_addr: None,
                in_flight: 0,
            })),
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets the max number of queries handled at the same time, instead of
    /// [MAX_IN_FLIGHT_QUERIES]. Takes effect on the next `start`.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The state stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Binds the listening socket and spawns the receive thread.
    ///
    /// Returns an error if the forwarder is not stopped, or if an address
    /// cannot be resolved or the socket cannot be bound. In the error case
    /// the forwarder stays stopped.
    pub fn start(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.state != ServerState::Stopped {
                return Err(e_fmt!("DNS forwarder is already {}", inner.state));
            }
            inner.state = ServerState::Starting;
        }

        let result = self.start_run_loop();
        if result.is_err() {
            self.lock().clear();
        }
        result
    }

    fn start_run_loop(&self) -> Result<()> {
        let listen_addr = resolve_addr(&self.listen_addr)?;

        // Resolved once. Every query connects its own socket to this address.
        let upstream = resolve_addr(&self.upstream_addr)?;

        let sock = new_socket(listen_addr, true)?;
        let std_sock = UdpSocket::from(sock);
        let local_addr = std_sock
            .local_addr()
            .map_err(|e| e_fmt!("failed to get local addr of listening socket: {}", e))?;
        let mut socket = MioUdpSocket::from_std(std_sock);

        let poller = Poll::new().map_err(|e| e_fmt!("failed to create mio Poll: {e}"))?;
        poller
            .registry()
            .register(&mut socket, LISTEN_SOCK_TOKEN, Interest::READABLE)
            .map_err(|e| e_fmt!("failed to add listening socket to the poller: {}", e))?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)
            .map_err(|e| e_fmt!("failed to create mio Waker: {}", e))?;

        let socket = Arc::new(socket);
        let (exit_s, exit_r) = bounded(1);

        {
            let mut inner = self.lock();
            inner.socket = Some(socket.clone());
            inner.waker = Some(Arc::new(waker));
            inner.exit_r = Some(exit_r);
            inner.local_addr = Some(local_addr);
            inner.state = ServerState::Running;
        }

        let forwarder = self.clone();
        thread::Builder::new()
            .name("dns_relay_recv".to_string())
            .spawn(move || forwarder.run(poller, socket, upstream, exit_s))
            .map_err(|e| e_fmt!("thread builder failed to spawn: {}", e))?;

        info!(
            "DNS forwarder listening on {}, forwarding to {}",
            local_addr,
            upstream
        );
        Ok(())
    }

    /// Stops the receive loop and closes the listening socket.
    ///
    /// Blocks until the receive thread has exited. Query threads already
    /// running are not waited for; their replies are dropped. Returns `Ok`
    /// right away if the forwarder is already stopped.
    ///
    /// Returns `Error::Again` if the forwarder is in the middle of starting.
    pub fn stop(&self) -> Result<()> {
        let (waker, exit_r) = {
            let mut inner = self.lock();
            match inner.state {
                ServerState::Stopped => return Ok(()),
                ServerState::Starting => return Err(Error::Again),
                ServerState::Stopping => (None, inner.exit_r.clone()),
                ServerState::Running => {
                    inner.state = ServerState::Stopping;
                    inner.socket = None;
                    inner.local_addr = None;
                    (inner.waker.take(), inner.exit_r.clone())
                }
            }
        };

        if let Some(waker) = waker {
            if let Err(e) = waker.wake() {
                debug!("failed to wake up the receive loop: {}", e);
            }
        }

        if let Some(exit_r) = exit_r {
            // Nothing is ever sent: `recv` returns once the loop drops its sender.
            let _ = exit_r.recv();
        }

        let mut inner = self.lock();
        if inner.state == ServerState::Stopping {
            inner.clear();
            info!("DNS forwarder stopped");
        }
        Ok(())
    }

    /// Starts the forwarder and blocks until it is stopped from another thread.
    pub fn listen_and_serve(&self) -> Result<()> {
        self.start()?;

        let exit_r = self.lock().exit_r.clone();
        if let Some(exit_r) = exit_r {
            let _ = exit_r.recv();
        }
        Ok(())
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    /// Returns the address the listening socket is bound to, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    /// Returns a snapshot of the counters.
    pub fn get_metrics(&self) -> Metrics {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn is_running(&self) -> bool {
        self.lock().state == ServerState::Running
    }

    fn increase_counter(&self, counter: Counter, count: i64) {
        let key = counter.to_string();
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters.entry(key).or_insert(0) += count;
    }

    /// The main loop of the receive thread.
    ///
    /// In each round, it will:
    /// 1. poll the listening socket with a short timeout.
    /// 2. read all pending datagrams and spawn a query thread for each.
    /// 3. check whether the forwarder is still running.
    fn run(
        &self,
        mut poller: Poll,
        socket: Arc<MioUdpSocket>,
        upstream: SocketAddr,
        exit_s: Sender<()>,
    ) {
        let mut events = Events::with_capacity(16);
        // One extra byte to tell an oversized datagram from a full one.
        let mut buf = vec![0; MAX_MSG_SIZE + 1];

        while self.is_running() {
            if let Err(e) = poller.poll(&mut events, Some(POLL_INTERVAL)) {
                if let Some(delay) = poll_retry_delay(e.kind()) {
                    debug!("failed to poll the listening socket: {}", e);
                    thread::sleep(delay);
                }
                continue;
            }

            for ev in events.iter() {
                if ev.token() == LISTEN_SOCK_TOKEN {
                    self.handle_read(&socket, &mut buf, upstream);
                }
                // WAKER_TOKEN: nothing to do, the loop condition checks the state.
            }
        }

        debug!("receive loop on {:?} exits", socket.local_addr());

        // Disconnects all receivers waiting in `stop` and `listen_and_serve`.
        drop(exit_s);
    }

    /// Reads until no more datagrams are available.
    fn handle_read(&self, socket: &MioUdpSocket, buf: &mut [u8], upstream: SocketAddr) {
        while self.is_running() {
            match socket.recv_from(buf) {
                Ok((len, client)) => {
                    trace!("received {} bytes from {}", len, client);
                    self.increase_counter(Counter::QueryReceived, 1);
                    if len > MAX_MSG_SIZE {
                        debug!(
                            "dropped datagram from {}: larger than {} bytes",
                            client,
                            MAX_MSG_SIZE
                        );
                        self.increase_counter(Counter::QueryDropped, 1);
                        continue;
                    }
                    self.dispatch(buf[..len].to_vec(), client, upstream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // e.g. an ICMP error from an earlier reply. Keep serving.
                    debug!("listening socket recv_from failed: {}", e);
                }
            }
        }
    }

    /// Hands one datagram to its own query thread, if a slot is free.
    fn dispatch(&self, query: Vec<u8>, client: SocketAddr, upstream: SocketAddr) {
        {
            let mut inner = self.lock();
            if inner.in_flight >= self.max_in_flight {
                debug!(
                    "dropped datagram from {}: {} queries in flight",
                    client,
                    inner.in_flight
                );
                drop(inner);
                self.increase_counter(Counter::QueryDropped, 1);
                return;
            }
            inner.in_flight += 1;
        }

        let forwarder = self.clone();
        let spawned = thread::Builder::new()
            .name("dns_relay_query".to_string())
            .spawn(move || {
                forwarder.handle_query(query, client, upstream);
                forwarder.release_slot();
            });

        if let Err(e) = spawned {
            error!("failed to spawn a query thread for {}: {}", client, e);
            self.release_slot();
            self.increase_counter(Counter::QueryDropped, 1);
        }
    }

    fn release_slot(&self) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Forwards one query and sends back the reply, or a SERVFAIL if the
    /// upstream fails.
    fn handle_query(&self, query: Vec<u8>, client: SocketAddr, upstream: SocketAddr) {
        let header = match DnsHeader::from_bytes(&query) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropped datagram from {}: {}", client, e);
                self.increase_counter(Counter::QueryDropped, 1);
                return;
            }
        };

        if header.is_response() {
            debug!(
                "dropped a response (id {}) from {}, expecting queries only",
                header.id,
                client
            );
            self.increase_counter(Counter::QueryDropped, 1);
            return;
        }

        // Decoding is only for logging and for the SERVFAIL questions.
        // The query is forwarded as is either way.
        let msg = match DnsMessage::from_bytes(&query) {
            Ok(msg) => {
                for question in msg.questions.iter() {
                    debug!(
                        "query id {} from {}: {} type {}",
                        header.id,
                        client,
                        question.name(),
                        question.ty()
                    );
                }
                Some(msg)
            }
            Err(e) => {
                debug!(
                    "query id {} from {} does not decode, forwarding as is: {}",
                    header.id,
                    client,
                    e
                );
                None
            }
        };

        let response = match forward_query(&query, header.id, upstream) {
            Ok(reply) => {
                self.increase_counter(Counter::UpstreamOk, 1);
                reply
            }
            Err(e) => {
                debug!("query id {} to {} failed: {}", header.id, upstream, e);
                self.increase_counter(Counter::UpstreamFailure, 1);
                servfail_response(header.id, msg).to_bytes()
            }
        };

        self.send_response(&response, client);
    }

    fn send_response(&self, response: &[u8], client: SocketAddr) {
        let socket = self.lock().socket.clone();
        let Some(socket) = socket else {
            debug!("forwarder stopped, dropped the response to {}", client);
            self.increase_counter(Counter::ResponseSendFailure, 1);
            return;
        };

        match socket.send_to(response, client) {
            Ok(sz) => {
                trace!("sent {} bytes to {}", sz, client);
                self.increase_counter(Counter::ResponseSent, 1);
            }
            Err(e) => {
                debug!("failed to send response to {}: {}", client, e);
                self.increase_counter(Counter::ResponseSendFailure, 1);
            }
        }
    }
}

/// Sends `query` to `upstream` on a new socket and returns the reply.
///
/// The whole round trip must complete within [UPSTREAM_TIMEOUT]. A reply
/// larger than [MAX_MSG_SIZE], one that does not decode, or one that is not
/// a DNS response is an error. A reply with an ID other than `id` is still
/// returned.
fn forward_query(query: &[u8], id: u16, upstream: SocketAddr) -> Result<Vec<u8>> {
    let deadline = Instant::now() + UPSTREAM_TIMEOUT;

    let sock = new_socket_connect(upstream)?;
    sock.send(query)
        .map_err(|e| e_fmt!("send to upstream {} failed: {}", upstream, e))?;

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(e_fmt!("upstream {} timed out", upstream));
    }
    sock.set_read_timeout(Some(remaining))
        .map_err(|e| e_fmt!("set read timeout failed: {}", e))?;

    let mut buf = vec![0; MAX_MSG_SIZE + 1];
    let len = sock
        .recv(&mut buf)
        .map_err(|e| e_fmt!("recv from upstream {} failed: {}", upstream, e))?;
    if len > MAX_MSG_SIZE {
        return Err(e_fmt!(
            "reply from upstream {} is larger than {} bytes",
            upstream,
            MAX_MSG_SIZE
        ));
    }
    buf.truncate(len);

    let reply = DnsMessage::from_bytes(&buf)?;
    if !reply.is_response() {
        return Err(e_fmt!("upstream {} replied with a non-response", upstream));
    }
    if reply.id() != id {
        debug!(
            "upstream {} replied with id {} to query id {}",
            upstream,
            reply.id(),
            id
        );
    }
    Ok(buf)
}

/// How long the receive loop waits before polling again after a poll error.
/// An interrupted poll is retried at once.
fn poll_retry_delay(kind: io::ErrorKind) -> Option<Duration> {
    match kind {
        io::ErrorKind::Interrupted => None,
        _ => Some(POLL_INTERVAL),
    }
}

/// Builds the SERVFAIL response for a query with `id`. Its questions are
/// copied from `query` if it could be decoded.
fn servfail_response(id: u16, query: Option<DnsMessage>) -> DnsMessage {
    let mut response = DnsMessage::new(id, FLAGS_QR_RESPONSE | FLAGS_RD | RCODE_SERVFAIL);
    if let Some(query) = query {
        response.questions = query.questions;
    }
    response
}

/// Resolves `addr` to its first socket address. A leading ":" means all
/// IPv4 interfaces.
fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    let full_addr;
    let addr = if addr.starts_with(':') {
        full_addr = format!("0.0.0.0{}", addr);
        full_addr.as_str()
    } else {
        addr
    };

    addr.to_socket_addrs()
        .map_err(|e| e_fmt!("failed to resolve address {}: {}", addr, e))?
        .next()
        .ok_or_else(|| e_fmt!("address {} resolved to nothing", addr))
}

fn socket_domain(addr: &SocketAddr) -> socket2::Domain {
    match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    }
}

/// Creates a new UDP socket bound to `addr` with the ReuseAddr option.
/// `non_block` indicates whether to set O_NONBLOCK for the socket.
fn new_socket(addr: SocketAddr, non_block: bool) -> Result<Socket> {
    let fd = Socket::new(socket_domain(&addr), socket2::Type::DGRAM, None)
        .map_err(|e| e_fmt!("create socket failed: {}", e))?;

    fd.set_reuse_address(true)
        .map_err(|e| e_fmt!("set ReuseAddr failed: {}", e))?;

    if non_block {
        fd.set_nonblocking(true)
            .map_err(|e| e_fmt!("set O_NONBLOCK: {}", e))?;
    }

    fd.bind(&addr.into())
        .map_err(|e| e_fmt!("socket bind to {} failed: {}", &addr, e))?;

    trace!("new socket bind to {}", &addr);
    Ok(fd)
}

/// Creates a new blocking UDP socket connected to `upstream`, with the
/// write timeout set to [UPSTREAM_TIMEOUT].
fn new_socket_connect(upstream: SocketAddr) -> Result<UdpSocket> {
    let fd = Socket::new(socket_domain(&upstream), socket2::Type::DGRAM, None)
        .map_err(|e| e_fmt!("create socket failed: {}", e))?;

    fd.connect(&upstream.into())
        .map_err(|e| e_fmt!("socket connect to {} failed: {}", &upstream, e))?;

    fd.set_write_timeout(Some(UPSTREAM_TIMEOUT))
        .map_err(|e| e_fmt!("set write timeout failed: {}", e))?;

    Ok(UdpSocket::from(fd))
}

#[cfg(test)]
mod tests {
    use super::{
        forward_query, poll_retry_delay, resolve_addr, servfail_response, DnsForwarder,
        ServerState, DEFAULT_UPSTREAM, MAX_MSG_SIZE, POLL_INTERVAL,
    };
    use crate::{
        dns_parser::{
            DnsMessage, DnsRecord, RRType, CLASS_IN, FLAGS_QR_RESPONSE, FLAGS_RD, RCODE_SERVFAIL,
        },
        error::Error,
    };
    use std::{
        io,
        net::{SocketAddr, UdpSocket},
        thread,
        time::Duration,
    };
    use test_log::test;

    #[test]
    fn test_default_addrs() {
        let forwarder = DnsForwarder::new("", "");
        assert_eq!(forwarder.listen_addr, "0.0.0.0:53");
        assert_eq!(forwarder.upstream_addr, DEFAULT_UPSTREAM);
        assert_eq!(forwarder.state(), ServerState::Stopped);
        assert_eq!(forwarder.local_addr(), None);
    }

    #[test]
    fn test_resolve_addr() {
        let addr = resolve_addr(":5353").unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:5353");

        let addr = resolve_addr("127.0.0.1:53").unwrap();
        assert_eq!(addr.port(), 53);

        assert!(resolve_addr("not an address").is_err());
        assert!(resolve_addr("127.0.0.1").is_err());
    }

    #[test]
    fn test_servfail_response() {
        let mut query = DnsMessage::new(4321, FLAGS_RD);
        query.add_question("test.com", RRType::A as u16).unwrap();

        let bytes = servfail_response(4321, Some(query.clone())).to_bytes();
        let response = DnsMessage::from_bytes(&bytes).unwrap();
        assert_eq!(response.id(), 4321);
        assert_eq!(
            response.header.flags,
            FLAGS_QR_RESPONSE | FLAGS_RD | RCODE_SERVFAIL
        );
        assert_eq!(response.header.rcode(), RCODE_SERVFAIL);
        assert_eq!(response.questions, query.questions);
        assert_eq!(response.header.num_answers, 0);
        assert_eq!(response.header.num_authorities, 0);
        assert_eq!(response.header.num_additionals, 0);

        let response = servfail_response(7, None);
        assert!(response.questions.is_empty());
        assert!(response.is_response());
    }

    #[test]
    fn test_lifecycle() {
        let forwarder = DnsForwarder::new("127.0.0.1:0", "127.0.0.1:53");

        // Stop on a stopped forwarder is a no-op.
        assert!(forwarder.stop().is_ok());

        forwarder.start().unwrap();
        assert_eq!(forwarder.state(), ServerState::Running);
        let addr = forwarder.local_addr().expect("bound address");
        assert_ne!(addr.port(), 0);

        // Already running.
        let result = forwarder.start();
        assert!(matches!(result, Err(Error::Msg(_))));
        assert_eq!(forwarder.state(), ServerState::Running);
        assert_eq!(forwarder.local_addr(), Some(addr));

        forwarder.stop().unwrap();
        assert_eq!(forwarder.state(), ServerState::Stopped);
        assert_eq!(forwarder.local_addr(), None);
        forwarder.stop().unwrap();

        // Can be started again.
        forwarder.start().unwrap();
        assert_eq!(forwarder.state(), ServerState::Running);
        forwarder.stop().unwrap();
    }

    #[test]
    fn test_concurrent_stop() {
        let forwarder = DnsForwarder::new("127.0.0.1:0", "127.0.0.1:53");
        forwarder.start().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let f = forwarder.clone();
                thread::spawn(move || f.stop())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(forwarder.state(), ServerState::Stopped);
    }

    #[test]
    fn test_start_failure_stays_stopped() {
        let forwarder = DnsForwarder::new("127.0.0.1:99999", "127.0.0.1:53");
        assert!(forwarder.start().is_err());
        assert_eq!(forwarder.state(), ServerState::Stopped);

        let forwarder = DnsForwarder::new("127.0.0.1:0", "bad upstream");
        assert!(forwarder.start().is_err());
        assert_eq!(forwarder.state(), ServerState::Stopped);
        assert_eq!(forwarder.local_addr(), None);
    }

    #[test]
    fn test_listen_and_serve_returns_after_stop() {
        let forwarder = DnsForwarder::new("127.0.0.1:0", "127.0.0.1:53");
        let f = forwarder.clone();
        let serving = thread::spawn(move || f.listen_and_serve());

        // Wait for the forwarder to be up.
        let mut tries = 0;
        while forwarder.state() != ServerState::Running && tries < 100 {
            thread::sleep(Duration::from_millis(10));
            tries += 1;
        }
        assert_eq!(forwarder.state(), ServerState::Running);

        forwarder.stop().unwrap();
        assert!(serving.join().unwrap().is_ok());
    }

    #[test]
    fn test_forward_query_rejects_non_response() {
        // An upstream that echoes the query back: QR bit is not set.
        let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        thread::spawn(move || {
            let mut buf = [0; 512];
            if let Ok((len, addr)) = upstream.recv_from(&mut buf) {
                let _ = upstream.send_to(&buf[..len], addr);
            }
        });

        let mut query = DnsMessage::new(99, FLAGS_RD);
        query.add_question("echo.test", RRType::A as u16).unwrap();
        let result = forward_query(&query.to_bytes(), 99, upstream_addr);
        assert!(matches!(result, Err(Error::Msg(_))));
    }

    /// An upstream that answers one query with `reply`.
    fn one_shot_upstream(reply: Vec<u8>) -> SocketAddr {
        let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        thread::spawn(move || {
            let mut buf = [0; 512];
            if let Ok((_, addr)) = upstream.recv_from(&mut buf) {
                let _ = upstream.send_to(&reply, addr);
            }
        });
        upstream_addr
    }

    fn response_with_txt(id: u16, rdata_len: usize) -> Vec<u8> {
        let mut response = DnsMessage::new(id, FLAGS_QR_RESPONSE | FLAGS_RD);
        response.add_question("big.test", RRType::TXT as u16).unwrap();
        let txt = DnsRecord::new(
            "big.test",
            RRType::TXT as u16,
            CLASS_IN,
            60,
            vec![b'x'; rdata_len],
        );
        response.add_answer(txt.unwrap());
        response.to_bytes()
    }

    #[test]
    fn test_forward_query_checks_reply_size() {
        let mut query = DnsMessage::new(7, FLAGS_RD);
        query.add_question("big.test", RRType::TXT as u16).unwrap();
        let query = query.to_bytes();

        // Fits exactly.
        let small = response_with_txt(7, 100);
        let padding = MAX_MSG_SIZE - small.len();
        let exact = response_with_txt(7, 100 + padding);
        assert_eq!(exact.len(), MAX_MSG_SIZE);
        let reply = forward_query(&query, 7, one_shot_upstream(exact.clone())).unwrap();
        assert_eq!(reply, exact);

        // One byte over.
        let over = response_with_txt(7, 101 + padding);
        assert_eq!(over.len(), MAX_MSG_SIZE + 1);
        let result = forward_query(&query, 7, one_shot_upstream(over));
        assert!(matches!(result, Err(Error::Msg(_))));
    }

    #[test]
    fn test_forward_query_rejects_undecodable_reply() {
        let mut query = DnsMessage::new(8, FLAGS_RD);
        query.add_question("cut.test", RRType::A as u16).unwrap();

        // A response header announcing one answer that is missing.
        let mut reply = DnsMessage::new(8, FLAGS_QR_RESPONSE | FLAGS_RD).to_bytes();
        reply[7] = 1;

        let result = forward_query(&query.to_bytes(), 8, one_shot_upstream(reply));
        assert!(matches!(result, Err(Error::Truncated(_))));
    }

    #[test]
    fn test_poll_retry_delay() {
        assert_eq!(poll_retry_delay(io::ErrorKind::Interrupted), None);
        assert_eq!(poll_retry_delay(io::ErrorKind::Other), Some(POLL_INTERVAL));
        assert_eq!(
            poll_retry_delay(io::ErrorKind::PermissionDenied),
            Some(POLL_INTERVAL)
        );
    }
}
