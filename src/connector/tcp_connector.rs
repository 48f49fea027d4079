use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use anyhow::{bail, Context};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::EndpointConfig;
use crate::connector::auth::{authenticate_candidate, SecretPair};
use crate::connector::sockets::{SocketGauge, SocketProvider, Tracked};
use crate::connector::wire::{proxy_header, AttemptMessage, TcpServerMessage, PROXY_HEADER_LEN};
use crate::connector::{ConnectionMode, ConnectorArgs, ConnectorEvent, ConnectorEvents, ConnectorFactory, ConnectorHandle, ConnectorState};
use crate::messaging::control_channel::{open_control_channel, ControlSender};
use crate::messaging::endpoint_addr::AddressFamily;
use crate::messaging::session_messages::AUTH_KEY_LEN;
use crate::runtime::{ScheduledTask, TaskRunner};

pub struct TcpConnectorFactory {
    config: Arc<EndpointConfig>,
    sockets: Arc<dyn SocketProvider>,
    runner: TaskRunner,
}
impl TcpConnectorFactory {
    pub fn new(config: Arc<EndpointConfig>, sockets: Arc<dyn SocketProvider>, runner: TaskRunner) -> TcpConnectorFactory {
        TcpConnectorFactory { config, sockets, runner }
    }
}

impl ConnectorFactory<TcpStream> for TcpConnectorFactory {
    fn start(&self, args: ConnectorArgs, events: ConnectorEvents<TcpStream>) -> Arc<dyn ConnectorHandle> {
        let connector = TcpConnector::new(args, self.config.clone(), self.sockets.clone(), self.runner.clone(), events);
        connector.start();
        Arc::new(connector)
    }
}

/// A single attempt at establishing a TCP connection through a rendezvous server.
///
/// The attempt first tries to connect peer-to-peer: it binds a P2P socket and a listener to the
///  local address of its control connection (so that all of them share a NAT mapping), announces
///  that address to the server and then races an outbound connect against inbound connections.
///  The first candidate that passes the secret exchange wins. If P2P sockets are not available,
///  or if no candidate succeeds in time, the attempt falls back to a connection that is relayed
///  by the server.
#[derive(Clone)]
pub struct TcpConnector {
    inner: Arc<Inner>,
}

struct Inner {
    args: ConnectorArgs,
    family: AddressFamily,
    config: Arc<EndpointConfig>,
    sockets: Arc<dyn SocketProvider>,
    runner: TaskRunner,
    gauge: SocketGauge,
    events: ConnectorEvents<TcpStream>,
    /// cancelled when the attempt completes, closing every socket held by the attempt's tasks
    cancel: CancellationToken,
    state: Mutex<TcpState>,
}

struct TcpState {
    phase: ConnectorState,
    control: Option<ControlSender>,
    local_addr: Option<SocketAddr>,
    /// covers the P2P phase's tasks only, so that falling back to proxy mode can close them
    p2p_cancel: CancellationToken,
    p2p_socket: Option<Tracked<TcpSocket>>,
    /// connections accepted before the server sent the secrets to check them with
    accepted: Vec<Tracked<TcpStream>>,
    secrets: Option<SecretPair>,
    attempt_timeout: Option<Arc<ScheduledTask>>,
}

impl TcpConnector {
    pub fn new(args: ConnectorArgs, config: Arc<EndpointConfig>, sockets: Arc<dyn SocketProvider>, runner: TaskRunner, events: ConnectorEvents<TcpStream>) -> TcpConnector {
        let cancel = CancellationToken::new();
        let p2p_cancel = cancel.child_token();

        TcpConnector {
            inner: Arc::new(Inner {
                family: AddressFamily::of(&args.server_ip),
                args,
                config,
                sockets,
                runner,
                gauge: SocketGauge::default(),
                events,
                cancel,
                state: Mutex::new(TcpState {
                    phase: ConnectorState::Initial,
                    control: None,
                    local_addr: None,
                    p2p_cancel,
                    p2p_socket: None,
                    accepted: Vec::new(),
                    secrets: None,
                    attempt_timeout: None,
                }),
            }),
        }
    }

    pub fn start(&self) {
        tokio::spawn(self.inner.clone().run());
    }

    pub fn state(&self) -> ConnectorState {
        self.inner.state.lock().phase
    }

    /// number of sockets the attempt currently holds
    pub fn open_sockets(&self) -> usize {
        self.inner.gauge.open_sockets()
    }
}

impl ConnectorHandle for TcpConnector {
    fn abort(&self) {
        let mut state = self.inner.state.lock();
        if state.phase != ConnectorState::Completed {
            debug!(connection_id = ?self.inner.args.connection_id, "aborting TCP connection attempt");
            self.inner.free(&mut state);
        }
    }

    fn on_authentication_hash(&self, hash: [u8; AUTH_KEY_LEN], key: [u8; AUTH_KEY_LEN]) {
        let state = self.inner.state.lock();
        self.inner.send_control(&state, AttemptMessage::AuthHash { hash, key });
    }
}

impl Inner {
    #[instrument(name = "tcp_connector", skip_all, fields(connection_id = ?self.args.connection_id))]
    async fn run(self: Arc<Self>) {
        if let Err(e) = self.clone().control_loop().await {
            self.complete_with_error(e);
        }
    }

    async fn control_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let server_addr = SocketAddr::new(self.args.server_ip, self.config.tcp_rzv_port);
        let socket = self.sockets.tcp_socket(self.family, &self.args.options)?;
        let guard = self.gauge.track();

        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            r = socket.connect(server_addr) => r.with_context(|| format!("connecting to rendezvous server {:?}", server_addr))?,
        };
        let local_addr = stream.local_addr()?;
        debug!("control connection from {:?} to {:?}", local_addr, server_addr);

        let (control, mut receiver) = open_control_channel(stream, guard, self.config.max_control_frame_len, self.cancel.clone());
        {
            let mut state = self.state.lock();
            if state.phase != ConnectorState::Initial {
                return Ok(());
            }
            state.control = Some(control);
            state.local_addr = Some(local_addr);

            let message = if self.open_p2p_sockets(&mut state, local_addr) {
                state.phase = ConnectorState::P2PMode;
                AttemptMessage::P2P { role: self.args.role, connection_id: self.args.connection_id, local: local_addr }
            }
            else {
                info!("P2P sockets are not available - requesting a proxy connection");
                state.phase = ConnectorState::ProxyMode;
                AttemptMessage::Proxy { role: self.args.role, connection_id: self.args.connection_id }
            };
            self.send_control(&state, message);
        }

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                frame = receiver.next() => frame?,
            };
            match frame {
                Some(frame) => self.on_control_message(TcpServerMessage::decode(&frame, self.family)?)?,
                None => bail!("rendezvous server closed the control connection"),
            }
        }
    }

    /// Both the P2P socket and the listener must be available, otherwise neither is used
    fn open_p2p_sockets(self: &Arc<Self>, state: &mut TcpState, local_addr: SocketAddr) -> bool {
        let p2p_socket = self.sockets.bind_tcp(local_addr, &self.args.options);
        let listener = self.sockets.bind_listener(local_addr, &self.args.options, self.config.listener_backlog);

        match (p2p_socket, listener) {
            (Ok(p2p_socket), Ok(listener)) => {
                state.p2p_socket = Some(Tracked { socket: p2p_socket, guard: self.gauge.track() });
                let listener = Tracked { socket: listener, guard: self.gauge.track() };
                tokio::spawn(self.clone().accept_loop(listener, state.p2p_cancel.clone()));
                true
            }
            (p2p_socket, listener) => {
                if let Err(e) = &p2p_socket {
                    debug!("could not bind P2P socket to {:?}: {}", local_addr, e);
                }
                if let Err(e) = &listener {
                    debug!("could not bind listener to {:?}: {}", local_addr, e);
                }
                false
            }
        }
    }

    fn on_control_message(self: &Arc<Self>, message: TcpServerMessage) -> anyhow::Result<()> {
        trace!("control message: {:?}", message);

        match message {
            TcpServerMessage::AuthKey(key) => {
                let _ = self.events.send(ConnectorEvent::AuthKey(key));
            }
            TcpServerMessage::CreateP2PConnection { peer_public, peer_private, secrets } => {
                self.on_create_p2p_connection(peer_public, peer_private, secrets);
            }
            TcpServerMessage::CreateProxyConnection { relay_port } => {
                self.on_create_proxy_connection(relay_port);
            }
            TcpServerMessage::Error => bail!("rendezvous server reported an error"),
        }
        Ok(())
    }

    fn on_create_p2p_connection(self: &Arc<Self>, peer_public: SocketAddr, peer_private: Option<SocketAddr>, secrets: SecretPair) {
        let mut state = self.state.lock();
        if state.phase != ConnectorState::P2PMode {
            debug!("ignoring P2P connection data in state {:?}", state.phase);
            return;
        }
        state.phase = ConnectorState::P2PHandshake;
        state.secrets = Some(secrets);

        let cancel = state.p2p_cancel.clone();
        for candidate in std::mem::take(&mut state.accepted) {
            tokio::spawn(self.clone().authenticate(candidate, secrets, cancel.clone()));
        }

        if let Some(p2p_socket) = state.p2p_socket.take() {
            tokio::spawn(self.clone().connect_p2p(p2p_socket, peer_public, secrets, cancel.clone()));
        }
        if let (Some(peer_private), Some(local_addr)) = (peer_private, state.local_addr) {
            match self.sockets.bind_tcp(local_addr, &self.args.options) {
                Ok(socket) => {
                    let socket = Tracked { socket, guard: self.gauge.track() };
                    tokio::spawn(self.clone().connect_p2p(socket, peer_private, secrets, cancel));
                }
                Err(e) => debug!("could not bind P2P socket for the peer's private address: {}", e),
            }
        }

        let weak: Weak<Inner> = Arc::downgrade(self);
        state.attempt_timeout = Some(self.runner.schedule(self.config.tcp_p2p_attempt_timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_p2p_attempt_timeout();
            }
        }));
    }

    fn on_p2p_attempt_timeout(&self) {
        let mut state = self.state.lock();
        if state.phase != ConnectorState::P2PHandshake {
            return;
        }

        info!("P2P attempt timed out - falling back to a proxy connection");
        state.phase = ConnectorState::ProxyMode;
        Self::close_p2p_sockets(&mut state);
        self.send_control(&state, AttemptMessage::P2PFailed);
    }

    fn on_create_proxy_connection(self: &Arc<Self>, relay_port: u16) {
        {
            let mut state = self.state.lock();
            match state.phase {
                ConnectorState::P2PMode | ConnectorState::P2PHandshake | ConnectorState::ProxyMode => {}
                phase => {
                    debug!("ignoring proxy connection data in state {:?}", phase);
                    return;
                }
            }
            state.phase = ConnectorState::ProxyHandshake;
            Self::close_p2p_sockets(&mut state);
            if let Some(timeout) = state.attempt_timeout.take() {
                timeout.cancel();
            }
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => return,
                r = inner.connect_proxy(relay_port) => r,
            };
            match result {
                Ok(stream) => inner.complete(stream, ConnectorState::ProxyHandshake, ConnectionMode::Proxy),
                Err(e) => inner.complete_with_error(e.context("proxy connection failed")),
            }
        });
    }

    async fn connect_proxy(&self, relay_port: u16) -> anyhow::Result<Tracked<TcpStream>> {
        let relay_addr = SocketAddr::new(self.args.server_ip, relay_port);
        debug!("connecting to relay at {:?}", relay_addr);

        let socket = self.sockets.tcp_socket(self.family, &self.args.options)?;
        let guard = self.gauge.track();
        let mut stream = socket.connect(relay_addr).await?;

        let header = proxy_header(self.args.role, &self.args.connection_id);
        stream.write_all(&header).await?;

        let mut ack = [0u8; PROXY_HEADER_LEN];
        stream.read_exact(&mut ack).await?;
        if ack != header {
            bail!("relay acknowledged with a mismatching header");
        }
        Ok(Tracked { socket: stream, guard })
    }

    async fn accept_loop(self: Arc<Self>, listener: Tracked<TcpListener>, cancel: CancellationToken) {
        for _ in 0..self.config.max_accepted_connections {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = listener.socket.accept() => r,
            };
            let (stream, peer_addr) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    debug!("error accepting P2P connections - closing listener: {}", e);
                    return;
                }
            };
            trace!("accepted P2P candidate from {:?}", peer_addr);
            let candidate = Tracked { socket: stream, guard: self.gauge.track() };

            let mut state = self.state.lock();
            match (state.phase, state.secrets) {
                (ConnectorState::P2PMode, _) => state.accepted.push(candidate),
                (ConnectorState::P2PHandshake, Some(secrets)) => {
                    tokio::spawn(self.clone().authenticate(candidate, secrets, cancel.clone()));
                }
                _ => return,
            }
        }
        warn!("P2P listener accepted the maximum of {} connections - closing", self.config.max_accepted_connections);
    }

    async fn connect_p2p(self: Arc<Self>, socket: Tracked<TcpSocket>, peer_addr: SocketAddr, secrets: SecretPair, cancel: CancellationToken) {
        let Tracked { socket, guard } = socket;

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = socket.connect(peer_addr) => r,
        };
        match stream {
            Ok(stream) => self.authenticate(Tracked { socket: stream, guard }, secrets, cancel).await,
            Err(e) => debug!("P2P connect to {:?} failed: {}", peer_addr, e),
        }
    }

    async fn authenticate(self: Arc<Self>, mut candidate: Tracked<TcpStream>, secrets: SecretPair, cancel: CancellationToken) {
        let authenticated = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            ok = authenticate_candidate(&mut candidate.socket, &secrets) => ok,
        };
        if authenticated {
            self.complete(candidate, ConnectorState::P2PHandshake, ConnectionMode::P2P);
        }
    }

    /// Completes the attempt successfully if it is still in `expected_phase`. Otherwise some
    ///  other path won the race, and the connection is dropped.
    fn complete(&self, connection: Tracked<TcpStream>, expected_phase: ConnectorState, mode: ConnectionMode) {
        {
            let mut state = self.state.lock();
            if state.phase != expected_phase {
                debug!("discarding {:?} connection in state {:?}", mode, state.phase);
                return;
            }
            self.free(&mut state);
        }

        info!("TCP connection established in {:?} mode", mode);
        let Tracked { socket, guard } = connection;
        drop(guard);
        let _ = self.events.send(ConnectorEvent::Connected { connection: socket, mode });
    }

    fn complete_with_error(&self, error: anyhow::Error) {
        {
            let mut state = self.state.lock();
            if state.phase == ConnectorState::Completed {
                return;
            }
            self.free(&mut state);
        }

        debug!("TCP connection attempt failed: {:#}", error);
        let _ = self.events.send(ConnectorEvent::Failed(error));
    }

    fn close_p2p_sockets(state: &mut TcpState) {
        state.p2p_cancel.cancel();
        state.p2p_socket = None;
        state.accepted.clear();
    }

    /// Moves to the terminal state, closing all sockets that are still open
    fn free(&self, state: &mut TcpState) {
        state.phase = ConnectorState::Completed;
        Self::close_p2p_sockets(state);
        if let Some(timeout) = state.attempt_timeout.take() {
            timeout.cancel();
        }
        state.control = None;
        self.cancel.cancel();
    }

    fn send_control(&self, state: &TcpState, message: AttemptMessage) {
        let Some(control) = &state.control else {
            debug!("no control channel - dropping {:?}", message);
            return;
        };

        let result = message.encode(self.family)
            .and_then(|frame| control.send(frame));
        if let Err(e) = result {
            debug!("error sending control message: {}", e);
        }
    }
}
