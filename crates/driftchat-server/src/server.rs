//! The event loop.
//!
//! Single-threaded `mio` poll loop owning every socket and the replica.
//! Each iteration: poll once, drain socket readiness into the ingress
//! queue, feed the queue through the replica, send whatever it emitted,
//! tick timers, and observe the shutdown flag. All consensus work,
//! including Ed25519 and fsync, runs inline on this thread; the only
//! blocking calls are the WAL's fsync and the poll itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use driftchat_types::{ReplicaId, MAX_CONNECTIONS};
use driftchat_vsr::instrumentation::METRICS;
use driftchat_vsr::{ClusterConfig, CommitSink, Output, Replica, SubmitReply, SubmitRequest};
use driftchat_wire::Transport;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::bounded_queue::{BoundedQueue, PushResult, QueuedEnvelope};
use crate::config::{peer_addr, NodeConfig};
use crate::connection::{Connection, ConnectionState};
use crate::error::{ServerError, ServerResult};

const LISTENER: Token = Token(0);

/// Poll timeout per loop iteration; bounds how stale the tick clock can
/// get on an idle process.
const POLL_TIMEOUT_MS: u64 = 10;

/// Wall-clock microseconds since the Unix epoch.
fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// The replica server.
pub struct Server {
    config: NodeConfig,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    /// Outbound link to each peer, when established.
    peer_tokens: [Option<Token>; 3],
    replica: Replica,
    ingress: BoundedQueue<QueuedEnvelope>,
    shutdown: Arc<AtomicBool>,
    sink: Box<dyn CommitSink>,
}

impl Server {
    /// Builds the server: validates configuration, opens and recovers
    /// the replica, and binds the listener (non-blocking, with
    /// `SO_REUSEADDR` set by the bind).
    pub fn new(
        config: NodeConfig,
        shutdown: Arc<AtomicBool>,
        sink: Box<dyn CommitSink>,
    ) -> ServerResult<Self> {
        config.validate()?;

        std::fs::create_dir_all(&config.data_dir)?;

        let cluster_id = config.parsed_cluster_id()?;
        let replica_id = config.parsed_replica_id();

        let mut transport = Transport::new(
            cluster_id,
            replica_id,
            config.parsed_secret_key()?,
            config.peer_public_keys()?,
        );
        // Nonces must outlive restarts; the wall clock is monotonic
        // enough across process lifetimes.
        transport.seed_nonce(driftchat_types::Nonce::new(now_us()));

        let cluster_config = ClusterConfig::new(cluster_id, replica_id)
            .with_timeouts(config.prepare_timeout_us(), config.view_change_timeout_us());
        cluster_config
            .validate()
            .expect("timeouts were validated with the node config");

        let replica = Replica::open(
            cluster_config,
            transport,
            config.wal_path(),
            config.wal_max_entries,
        )?;

        let addr = config.bind_addr()?;
        let mut listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let ingress = BoundedQueue::new(config.queue_capacity);

        tracing::info!(
            replica = %replica_id,
            addr = %addr,
            "listening"
        );

        Ok(Self {
            config,
            poll,
            events: Events::with_capacity(1024),
            listener,
            connections: HashMap::new(),
            next_token: 1,
            peer_tokens: [None, None, None],
            replica,
            ingress,
            shutdown,
            sink,
        })
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Runs until the shutdown flag is observed, then drains cleanly.
    pub fn run(&mut self) -> ServerResult<()> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("shutdown requested, draining");
                self.drain();
                return Ok(());
            }
            self.run_once(POLL_TIMEOUT_MS)?;
        }
    }

    /// Polls once and processes everything that became ready.
    ///
    /// Returns the number of readiness events observed.
    pub fn run_once(&mut self, timeout_ms: u64) -> ServerResult<usize> {
        self.poll
            .poll(&mut self.events, Some(Duration::from_millis(timeout_ms)))?;

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();
        let count = ready.len();

        for (token, readable, writable) in ready {
            if token == LISTENER {
                self.accept_ready();
            } else {
                self.connection_ready(token, readable, writable);
            }
        }

        self.process_ingress();

        let now = now_us();
        let tick_output = self.replica.tick(now)?;
        self.dispatch(tick_output);

        self.ensure_peer_links();
        self.sweep_closed();
        self.reregister_interests()?;

        METRICS.set_queue_depth(self.ingress.len() as u64);
        METRICS.set_open_connections(self.connections.len() as u64);

        Ok(count)
    }

    /// Submits a client operation through this replica (the edge
    /// gateway's entry point).
    pub fn submit(&mut self, request: &SubmitRequest) -> ServerResult<SubmitReply> {
        let (reply, output) = self.replica.submit(request, now_us())?;
        self.dispatch(output);
        Ok(reply)
    }

    // ========================================================================
    // Socket readiness
    // ========================================================================

    /// Accepts until the listener would block.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, remote)) => {
                    if self.connections.len() >= MAX_CONNECTIONS {
                        tracing::warn!(
                            remote = %remote,
                            limit = MAX_CONNECTIONS,
                            "refusing connection: pool full"
                        );
                        drop(stream);
                        continue;
                    }
                    match self.register_connection(stream, None) {
                        Ok(token) => {
                            tracing::debug!(remote = %remote, token = token.0, "accepted")
                        }
                        Err(err) => tracing::warn!(error = %err, "failed to register accept"),
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn register_connection(
        &mut self,
        mut stream: TcpStream,
        peer: Option<ReplicaId>,
    ) -> ServerResult<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;

        let connection = match peer {
            Some(peer_id) => {
                self.poll
                    .registry()
                    .register(&mut stream, token, Interest::WRITABLE)?;
                self.peer_tokens[peer_id.as_usize()] = Some(token);
                Connection::connecting(token, stream, peer_id)
            }
            None => {
                self.poll
                    .registry()
                    .register(&mut stream, token, Interest::READABLE)?;
                Connection::accepted(token, stream)
            }
        };

        self.connections.insert(token, connection);
        Ok(token)
    }

    fn connection_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let now = now_us();
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };

        if writable {
            if connection.state == ConnectionState::Connecting {
                // Write-readiness on a connecting socket means the
                // connect resolved, one way or the other.
                match connection.stream.take_error() {
                    Ok(None) => {
                        connection.state = ConnectionState::Connected;
                        tracing::debug!(
                            peer = ?connection.peer,
                            token = token.0,
                            "peer link established"
                        );
                    }
                    Ok(Some(err)) => {
                        tracing::debug!(peer = ?connection.peer, error = %err, "connect failed");
                        connection.state = ConnectionState::Closed;
                    }
                    Err(err) => {
                        tracing::debug!(peer = ?connection.peer, error = %err, "connect failed");
                        connection.state = ConnectionState::Closed;
                    }
                }
            }
            if connection.state == ConnectionState::Connected {
                if let Err(err) = connection.write() {
                    tracing::debug!(token = token.0, error = %err, "write failed");
                    connection.state = ConnectionState::Closed;
                }
            }
        }

        if readable && connection.state == ConnectionState::Connected {
            match connection.read() {
                Ok(true) => {}
                Ok(false) => connection.state = ConnectionState::Closed,
                Err(err) => {
                    tracing::debug!(token = token.0, error = %err, "read failed");
                    connection.state = ConnectionState::Closed;
                }
            }

            // Frame out every complete envelope.
            while connection.state == ConnectionState::Connected {
                match connection.try_decode_envelope() {
                    Ok(Some(envelope)) => {
                        let queued = QueuedEnvelope {
                            from: connection.peer,
                            envelope,
                            received_at_us: now,
                        };
                        if let PushResult::Backpressure(dropped) = self.ingress.try_push(queued) {
                            tracing::warn!(
                                nonce = dropped.envelope.header.nonce.as_u64(),
                                "ingress queue full, dropping envelope"
                            );
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        // Framing is lost; the link cannot recover.
                        tracing::warn!(token = token.0, error = %err, "bad frame, closing");
                        connection.state = ConnectionState::Closed;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Replica driving
    // ========================================================================

    fn process_ingress(&mut self) {
        while let Some(queued) = self.ingress.pop() {
            match self
                .replica
                .handle_envelope(&queued.envelope, queued.received_at_us)
            {
                Ok(output) => self.dispatch(output),
                Err(err) => {
                    // Verification and protocol rejections are expected
                    // under partition or attack; drop and continue.
                    tracing::debug!(from = ?queued.from, error = %err, "envelope rejected");
                }
            }
        }
    }

    /// Sends outbound envelopes and fans out commits.
    fn dispatch(&mut self, output: Output) {
        for item in output.outbound {
            let targets: Vec<ReplicaId> = match item.to {
                Some(id) => vec![id],
                None => ReplicaId::all()
                    .filter(|&id| id != self.replica.config().replica_id)
                    .collect(),
            };
            for target in targets {
                self.send_to_peer(target, &item.envelope);
            }
        }

        for committed in output.committed {
            self.sink
                .on_commit(committed.room_id, committed.op, &committed.message);
        }

        // The audit log itself lives outside the core; its records are
        // surfaced on the structured log until it is attached.
        for record in output.audit {
            tracing::info!(
                view = %record.view,
                last_op = %record.last_op,
                commit = %record.commit_num,
                "view change audit record"
            );
        }
    }

    fn send_to_peer(&mut self, peer: ReplicaId, envelope: &driftchat_wire::Envelope) {
        let token = match self.peer_tokens[peer.as_usize()] {
            Some(token) if self.connections.contains_key(&token) => token,
            _ => match self.connect_to_peer(peer) {
                Some(token) => token,
                None => {
                    tracing::debug!(peer = %peer, "no link, dropping envelope");
                    return;
                }
            },
        };

        if let Some(connection) = self.connections.get_mut(&token) {
            connection.queue_envelope(envelope);
        }
    }

    /// Starts a non-blocking connect to a peer replica.
    fn connect_to_peer(&mut self, peer: ReplicaId) -> Option<Token> {
        if self.connections.len() >= MAX_CONNECTIONS {
            tracing::warn!(peer = %peer, "cannot connect: pool full");
            return None;
        }

        let peer_config = self
            .config
            .peers
            .iter()
            .find(|p| p.replica_id == peer.as_u8())?;
        let addr = peer_addr(peer_config).ok()?;

        match TcpStream::connect(addr) {
            Ok(stream) => match self.register_connection(stream, Some(peer)) {
                Ok(token) => Some(token),
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "failed to register connect");
                    None
                }
            },
            Err(err) => {
                tracing::debug!(peer = %peer, error = %err, "connect failed");
                None
            }
        }
    }

    /// Keeps an outbound link open to each peer.
    fn ensure_peer_links(&mut self) {
        for peer in ReplicaId::all() {
            if peer == self.replica.config().replica_id {
                continue;
            }
            let live = self.peer_tokens[peer.as_usize()]
                .map(|token| self.connections.contains_key(&token))
                .unwrap_or(false);
            if !live {
                self.connect_to_peer(peer);
            }
        }
    }

    // ========================================================================
    // Pool maintenance
    // ========================================================================

    fn sweep_closed(&mut self) {
        let closed: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state == ConnectionState::Closed)
            .map(|(&t, _)| t)
            .collect();

        for token in closed {
            if let Some(mut connection) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut connection.stream);
                if let Some(peer) = connection.peer {
                    if self.peer_tokens[peer.as_usize()] == Some(token) {
                        self.peer_tokens[peer.as_usize()] = None;
                    }
                }
                tracing::debug!(token = token.0, "connection closed");
            }
        }
    }

    fn reregister_interests(&mut self) -> ServerResult<()> {
        for (&token, connection) in self.connections.iter_mut() {
            let interest = connection.interest();
            self.poll
                .registry()
                .reregister(&mut connection.stream, token, interest)?;
        }
        Ok(())
    }

    /// Shutdown path: stop accepting, flush what we can, close
    /// everything.
    fn drain(&mut self) {
        let _ = self.poll.registry().deregister(&mut self.listener);
        self.ingress.clear();

        for (_, connection) in self.connections.iter_mut() {
            if connection.state == ConnectionState::Connected && connection.has_pending_write() {
                let _ = connection.write();
            }
            connection.state = ConnectionState::Closed;
        }
        self.sweep_closed();
    }
}
