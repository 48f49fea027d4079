use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use crate::config::EndpointConfig;
use crate::connector::sockets::{SocketGauge, SocketGuard, SocketProvider};
use crate::connector::wire::{endpoint_info, hole_punch, parse_hole_punch, AttemptMessage, PunchTarget, UdpServerMessage};
use crate::connector::{ConnectionMode, ConnectorArgs, ConnectorEvent, ConnectorEvents, ConnectorFactory, ConnectorHandle, ConnectorState, Role};
use crate::messaging::control_channel::{open_control_channel, ControlSender};
use crate::messaging::endpoint_addr::{AddressFamily, EndpointId};
use crate::messaging::session_messages::AUTH_KEY_LEN;
use crate::runtime::{ScheduledTask, TaskRunner};

/// An established UDP path to a peer. In proxy mode, the remote address is the rendezvous
///  server's relay port, and the server forwards datagrams to the peer.
#[derive(Debug)]
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}
impl UdpConnection {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send(&self, datagram: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(datagram, self.remote).await
    }

    /// Receives the next datagram from the remote address, discarding datagrams from anywhere
    ///  else
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let (len, from) = self.socket.recv_from(buf).await?;
            if from == self.remote {
                return Ok(len);
            }
            trace!("discarding datagram from {:?}", from);
        }
    }

    pub fn into_socket(self) -> Arc<UdpSocket> {
        self.socket
    }
}

pub struct UdpConnectorFactory {
    config: Arc<EndpointConfig>,
    sockets: Arc<dyn SocketProvider>,
    runner: TaskRunner,
}
impl UdpConnectorFactory {
    pub fn new(config: Arc<EndpointConfig>, sockets: Arc<dyn SocketProvider>, runner: TaskRunner) -> UdpConnectorFactory {
        UdpConnectorFactory { config, sockets, runner }
    }
}

impl ConnectorFactory<UdpConnection> for UdpConnectorFactory {
    fn start(&self, args: ConnectorArgs, events: ConnectorEvents<UdpConnection>) -> Arc<dyn ConnectorHandle> {
        let connector = UdpConnector::new(args, self.config.clone(), self.sockets.clone(), self.runner.clone(), events);
        connector.start();
        Arc::new(connector)
    }
}

/// A single attempt at establishing a UDP path through a rendezvous server.
///
/// The server issues an endpoint id, which this side announces from a fresh datagram socket
///  until the server knows the socket's public address and responds with the peer's endpoint(s).
///  Both sides then punch holes by sending datagrams to each other.
///
/// The two roles finish the handshake differently. The service reports each punch it receives to
///  the server, which relays it to the client. The client thereby learns that its outbound
///  direction works, and once it has received the service's punch as well, it declares the P2P
///  connection created. The server relays that to the service, which then completes with the
///  address the client's punch came from.
///
/// If hole punching does not succeed in time, the attempt falls back to relaying datagrams
///  through the server, using the same socket.
#[derive(Clone)]
pub struct UdpConnector {
    inner: Arc<Inner>,
}

struct Inner {
    args: ConnectorArgs,
    family: AddressFamily,
    config: Arc<EndpointConfig>,
    sockets: Arc<dyn SocketProvider>,
    runner: TaskRunner,
    gauge: SocketGauge,
    events: ConnectorEvents<UdpConnection>,
    cancel: CancellationToken,
    state: Mutex<UdpState>,
}

#[derive(Clone, Copy, Debug)]
struct PeerEndpoints {
    public: SocketAddr,
    private: Option<SocketAddr>,
    endpoint_id: EndpointId,
}

struct UdpState {
    phase: ConnectorState,
    control: Option<ControlSender>,
    local_ip: Option<IpAddr>,
    socket: Option<Arc<UdpSocket>>,
    socket_guard: Option<SocketGuard>,
    own_endpoint_id: Option<EndpointId>,
    /// stops endpoint announcements once the server knows our public address
    announcement_cancel: CancellationToken,
    peer: Option<PeerEndpoints>,
    /// the peer's hole punch reached us
    inbound_punched: bool,
    /// client only: our hole punch reached the service, as reported by the server
    outbound_punched: bool,
    /// where the peer's first valid hole punch came from
    remote: Option<SocketAddr>,
    timeouts: Vec<Arc<ScheduledTask>>,
}

impl UdpConnector {
    pub fn new(args: ConnectorArgs, config: Arc<EndpointConfig>, sockets: Arc<dyn SocketProvider>, runner: TaskRunner, events: ConnectorEvents<UdpConnection>) -> UdpConnector {
        let cancel = CancellationToken::new();
        let announcement_cancel = cancel.child_token();

        UdpConnector {
            inner: Arc::new(Inner {
                family: AddressFamily::of(&args.server_ip),
                args,
                config,
                sockets,
                runner,
                gauge: SocketGauge::default(),
                events,
                cancel,
                state: Mutex::new(UdpState {
                    phase: ConnectorState::Initial,
                    control: None,
                    local_ip: None,
                    socket: None,
                    socket_guard: None,
                    own_endpoint_id: None,
                    announcement_cancel,
                    peer: None,
                    inbound_punched: false,
                    outbound_punched: false,
                    remote: None,
                    timeouts: Vec::new(),
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

    pub fn open_sockets(&self) -> usize {
        self.inner.gauge.open_sockets()
    }
}

impl ConnectorHandle for UdpConnector {
    fn abort(&self) {
        let mut state = self.inner.state.lock();
        if state.phase != ConnectorState::Completed {
            debug!(connection_id = ?self.inner.args.connection_id, "aborting UDP connection attempt");
            self.inner.free(&mut state);
        }
    }

    fn on_authentication_hash(&self, hash: [u8; AUTH_KEY_LEN], key: [u8; AUTH_KEY_LEN]) {
        let state = self.inner.state.lock();
        self.inner.send_control(&state, AttemptMessage::AuthHash { hash, key });
    }
}

impl Inner {
    fn server_udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.args.server_ip, self.config.udp_rzv_port)
    }

    #[instrument(name = "udp_connector", skip_all, fields(connection_id = ?self.args.connection_id))]
    async fn run(self: Arc<Self>) {
        if let Err(e) = self.clone().control_loop().await {
            self.complete_with_error(e);
        }
    }

    async fn control_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let server_addr = self.server_udp_addr();
        let socket = self.sockets.tcp_socket(self.family, &self.args.options)?;
        let guard = self.gauge.track();

        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            r = socket.connect(server_addr) => r.with_context(|| format!("connecting to rendezvous server {:?}", server_addr))?,
        };
        let local_ip = stream.local_addr()?.ip();

        let (control, mut receiver) = open_control_channel(stream, guard, self.config.max_control_frame_len, self.cancel.clone());
        {
            let mut state = self.state.lock();
            if state.phase != ConnectorState::Initial {
                return Ok(());
            }
            state.control = Some(control);
            state.local_ip = Some(local_ip);
            self.send_control(&state, AttemptMessage::Endpoint { role: self.args.role, connection_id: self.args.connection_id });
        }

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                frame = receiver.next() => frame?,
            };
            match frame {
                Some(frame) => self.on_control_message(UdpServerMessage::decode(&frame, self.family)?)?,
                None => bail!("rendezvous server closed the control connection"),
            }
        }
    }

    fn on_control_message(self: &Arc<Self>, message: UdpServerMessage) -> anyhow::Result<()> {
        trace!("control message: {:?}", message);

        match message {
            UdpServerMessage::AuthKey { key, endpoint_id } => {
                self.on_auth_key(endpoint_id)?;
                let _ = self.events.send(ConnectorEvent::AuthKey(key));
            }
            UdpServerMessage::CreateP2PConnection { peer_public, peer_private, peer_endpoint_id } => {
                self.on_create_p2p_connection(PeerEndpoints { public: peer_public, private: peer_private, endpoint_id: peer_endpoint_id });
            }
            UdpServerMessage::P2PHolePunched => self.on_outbound_punched(),
            UdpServerMessage::P2PConnectionCreated => self.on_p2p_connection_created(),
            UdpServerMessage::ProxyConnectionCreated => self.on_proxy_connection_created(),
            UdpServerMessage::Error => bail!("rendezvous server reported an error"),
        }
        Ok(())
    }

    /// Binds the attempt's datagram socket and starts announcing it to the server
    fn on_auth_key(self: &Arc<Self>, endpoint_id: EndpointId) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.phase != ConnectorState::Initial || state.socket.is_some() {
            debug!("ignoring repeated endpoint id");
            return Ok(());
        }
        let local_ip = state.local_ip
            .ok_or_else(|| anyhow!("endpoint id received before the control connection was registered"))?;

        let socket = Arc::new(self.sockets.bind_udp(SocketAddr::new(local_ip, 0), &self.args.options)?);
        let local_addr = socket.local_addr()?;
        debug!("bound datagram socket to {:?}", local_addr);

        state.socket = Some(socket.clone());
        state.socket_guard = Some(self.gauge.track());
        state.own_endpoint_id = Some(endpoint_id);

        let info = endpoint_info(&endpoint_id, local_addr)?;
        tokio::spawn(self.clone().receive_loop(socket.clone()));
        tokio::spawn(self.clone().announce_endpoint(socket, info, state.announcement_cancel.clone()));
        Ok(())
    }

    /// Sends the endpoint info with doubling intervals. The attempt fails if the server does not
    ///  respond with the peer's endpoint within a grace period after the last announcement.
    async fn announce_endpoint(self: Arc<Self>, socket: Arc<UdpSocket>, info: Bytes, cancel: CancellationToken) {
        let server_addr = self.server_udp_addr();
        let mut interval = self.config.endpoint_info_initial_interval;

        loop {
            trace!("announcing endpoint to {:?}", server_addr);
            if let Err(e) = socket.send_to(&info, server_addr).await {
                debug!("error sending endpoint info: {}", e);
            }
            if interval > self.config.endpoint_info_max_interval {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            interval *= 2;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.udp_grace_period) => {}
        }
        self.complete_with_error(anyhow!("rendezvous server did not respond to endpoint announcements"));
    }

    fn on_create_p2p_connection(self: &Arc<Self>, peer: PeerEndpoints) {
        let mut state = self.state.lock();
        let (Some(socket), Some(own_endpoint_id)) = (state.socket.clone(), state.own_endpoint_id) else {
            debug!("ignoring P2P connection data before the endpoint was announced");
            return;
        };
        if state.phase != ConnectorState::Initial {
            debug!("ignoring P2P connection data in state {:?}", state.phase);
            return;
        }

        debug!("hole punching to {:?}", peer);
        state.phase = ConnectorState::P2PHandshake;
        state.peer = Some(peer);
        state.announcement_cancel.cancel();

        tokio::spawn(self.clone().punch(socket.clone(), peer.public, hole_punch(PunchTarget::Public, &own_endpoint_id)));
        if let Some(private) = peer.private {
            tokio::spawn(self.clone().punch(socket, private, hole_punch(PunchTarget::Private, &own_endpoint_id)));
        }

        let weak: Weak<Inner> = Arc::downgrade(self);
        let timeout = self.runner.schedule(self.config.udp_p2p_attempt_timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_p2p_attempt_timeout();
            }
        });
        state.timeouts.push(timeout);
    }

    async fn punch(self: Arc<Self>, socket: Arc<UdpSocket>, target: SocketAddr, datagram: Bytes) {
        for attempt in 0..self.config.hole_punch_attempts {
            if attempt > 0 {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.hole_punch_interval) => {}
                }
            }
            if self.state.lock().phase != ConnectorState::P2PHandshake {
                return;
            }

            trace!("sending hole punch #{} to {:?}", attempt + 1, target);
            if let Err(e) = socket.send_to(&datagram, target).await {
                debug!("error sending hole punch to {:?}: {}", target, e);
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; 64];
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                r = socket.recv_from(&mut buf) => r,
            };
            match received {
                Ok((len, from)) => match parse_hole_punch(&buf[..len]) {
                    Some((target, endpoint_id)) => self.on_hole_punch(target, endpoint_id, from),
                    None => trace!("ignoring datagram from {:?}", from),
                },
                Err(e) => {
                    if !self.on_receive_error(e) {
                        return;
                    }
                }
            }
        }
    }

    /// Returns whether receiving can go on
    fn on_receive_error(&self, e: std::io::Error) -> bool {
        if e.kind() == std::io::ErrorKind::ConnectionReset {
            trace!("ICMP error on datagram socket: {}", e);
            return true;
        }
        debug!("error receiving datagrams: {}", e);
        self.complete_with_error(anyhow::Error::new(e).context("receiving datagrams"));
        false
    }

    fn on_hole_punch(&self, target: PunchTarget, endpoint_id: EndpointId, from: SocketAddr) {
        let mut state = self.state.lock();
        if state.phase != ConnectorState::P2PHandshake || state.inbound_punched {
            return;
        }
        if state.peer.map(|p| p.endpoint_id) != Some(endpoint_id) {
            debug!("ignoring hole punch from unexpected endpoint {:?} at {:?}", endpoint_id, from);
            return;
        }

        debug!("received {:?} hole punch from {:?}", target, from);
        state.inbound_punched = true;
        state.remote = Some(from);
        match self.args.role {
            Role::Client => self.try_complete_client_p2p(state),
            Role::Service => self.send_control(&state, match target {
                PunchTarget::Public => AttemptMessage::P2PHolePunched,
                PunchTarget::Private => AttemptMessage::P2PLocalHolePunched,
            }),
        }
    }

    fn on_outbound_punched(&self) {
        let mut state = self.state.lock();
        if self.args.role != Role::Client {
            debug!("ignoring hole punch notification on the service side");
            return;
        }
        if state.phase == ConnectorState::P2PHandshake {
            state.outbound_punched = true;
            self.try_complete_client_p2p(state);
        }
    }

    /// The client side declares the P2P connection created once both directions are punched
    fn try_complete_client_p2p(&self, state: MutexGuard<UdpState>) {
        if !(state.inbound_punched && state.outbound_punched) {
            return;
        }
        let Some(remote) = state.remote else {
            return;
        };
        self.send_control(&state, AttemptMessage::P2PConnectionCreated);
        self.complete(state, remote, ConnectionMode::P2P);
    }

    /// The service side completes when the server relays the client's confirmation, provided the
    ///  client's punch reached us first
    fn on_p2p_connection_created(&self) {
        let state = self.state.lock();
        if self.args.role != Role::Service {
            debug!("ignoring P2P confirmation on the client side");
            return;
        }
        let (phase, remote, inbound_punched) = (state.phase, state.remote, state.inbound_punched);
        match (phase, remote) {
            (ConnectorState::P2PHandshake, Some(remote)) if inbound_punched => {
                self.complete(state, remote, ConnectionMode::P2P);
            }
            (phase, _) => debug!("ignoring P2P confirmation in state {:?} before an inbound hole punch", phase),
        }
    }

    fn on_p2p_attempt_timeout(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.phase != ConnectorState::P2PHandshake {
            return;
        }

        if state.inbound_punched {
            debug!("waiting for the P2P handshake to be confirmed");
        }
        else {
            info!("hole punching timed out - falling back to a relayed connection");
            state.phase = ConnectorState::ProxyHandshake;
            self.send_control(&state, AttemptMessage::CreateProxyConnection);
        }

        let weak: Weak<Inner> = Arc::downgrade(self);
        let timeout = self.runner.schedule(self.config.udp_grace_period, move || {
            if let Some(inner) = weak.upgrade() {
                inner.complete_with_error(anyhow!("no UDP path was established in time"));
            }
        });
        state.timeouts.push(timeout);
    }

    fn on_proxy_connection_created(&self) {
        let state = self.state.lock();
        let phase = state.phase;
        let bound = state.socket.is_some();
        match phase {
            ConnectorState::Initial | ConnectorState::P2PHandshake | ConnectorState::ProxyHandshake if bound => {
                let relay = self.server_udp_addr();
                self.complete(state, relay, ConnectionMode::Proxy);
            }
            phase => debug!("ignoring proxy confirmation in state {:?}", phase),
        }
    }

    fn complete(&self, mut state: MutexGuard<UdpState>, remote: SocketAddr, mode: ConnectionMode) {
        let socket = state.socket.take();
        self.free(&mut state);
        drop(state);

        match socket {
            Some(socket) => {
                info!("UDP path to {:?} established in {:?} mode", remote, mode);
                let _ = self.events.send(ConnectorEvent::Connected { connection: UdpConnection { socket, remote }, mode });
            }
            None => {
                let _ = self.events.send(ConnectorEvent::Failed(anyhow!("completed without a datagram socket")));
            }
        }
    }

    fn complete_with_error(&self, error: anyhow::Error) {
        {
            let mut state = self.state.lock();
            if state.phase == ConnectorState::Completed {
                return;
            }
            self.free(&mut state);
        }

        debug!("UDP connection attempt failed: {:#}", error);
        let _ = self.events.send(ConnectorEvent::Failed(error));
    }

    fn free(&self, state: &mut UdpState) {
        state.phase = ConnectorState::Completed;
        for timeout in state.timeouts.drain(..) {
            timeout.cancel();
        }
        state.socket = None;
        state.socket_guard = None;
        state.control = None;
        self.cancel.cancel();
    }

    fn send_control(&self, state: &UdpState, message: AttemptMessage) {
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
