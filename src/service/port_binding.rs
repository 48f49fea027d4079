use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::config::SocketOptions;
use crate::connector::udp_connector::UdpConnection;
use crate::connector::{ConnectionMode, ConnectorArgs, ConnectorEvent, ConnectorFactory, ConnectorHandle, Role};
use crate::error::{error_code, RequestError};
use crate::messaging::endpoint_addr::ConnectionId;
use crate::messaging::session::SessionChannel;
use crate::messaging::session_messages::{ModuleId, RequestId, SessionMessage};
use crate::runtime::{ScheduledTask, TaskRunner};

pub type TcpPortBindings = PortBindings<TcpStream>;
pub type UdpPortBindings = PortBindings<UdpConnection>;

/// A connection from a client to one of this service's virtual ports
#[derive(Debug)]
pub struct AcceptedConnection<C> {
    pub connection: C,
    pub mode: ConnectionMode,
    pub client_id: i64,
    pub session_tag: Option<Bytes>,
}

type AcceptHandler<C> = Arc<dyn Fn(AcceptedConnection<C>) + Send + Sync>;

/// The service side of connect requests: virtual ports that clients can connect to.
///
/// A client's request arrives as an incoming request, which is acknowledged if the port is bound
///  and has room in its backlog. The server then sends routing data for a connection attempt in
///  the service role. An established connection is confirmed to the client through the server and
///  handed to the port's accept handler, or queued until there is one.
pub struct PortBindings<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for PortBindings<C> {
    fn clone(&self) -> Self {
        PortBindings { inner: self.inner.clone() }
    }
}

struct Inner<C> {
    module_id: ModuleId,
    attempt_wait: Duration,
    factory: Arc<dyn ConnectorFactory<C>>,
    runner: TaskRunner,
    state: Mutex<BindingsState<C>>,
}

struct BindingsState<C> {
    session: Option<Arc<dyn SessionChannel>>,
    ports: FxHashMap<i32, Binding<C>>,
}

struct IncomingRequest {
    client_id: i64,
    session_tag: Option<Bytes>,
    /// frees the backlog slot if the server never sends routing data
    expiry: Arc<ScheduledTask>,
}

struct PendingAccept {
    request_id: RequestId,
    client_id: i64,
    session_tag: Option<Bytes>,
    server_id: i32,
    connector: Arc<dyn ConnectorHandle>,
    timeout: Arc<ScheduledTask>,
}
impl PendingAccept {
    fn abort(self) {
        self.timeout.cancel();
        self.connector.abort();
    }
}

struct Binding<C> {
    backlog: usize,
    socket_options: SocketOptions,
    /// acknowledged requests that are waiting for routing data
    requested: FxHashMap<RequestId, IncomingRequest>,
    /// connection attempts in progress
    pending: FxHashMap<ConnectionId, PendingAccept>,
    ready: VecDeque<AcceptedConnection<C>>,
    handler: Option<AcceptHandler<C>>,
}
impl<C> Binding<C> {
    fn is_full(&self) -> bool {
        self.requested.len() + self.pending.len() + self.ready.len() >= self.backlog
    }

    fn abort_all(&mut self) {
        for (_, request) in self.requested.drain() {
            request.expiry.cancel();
        }
        for (_, pending) in self.pending.drain() {
            pending.abort();
        }
    }
}

impl<C: Send + 'static> PortBindings<C> {
    pub fn new(module_id: ModuleId, attempt_wait: Duration, factory: Arc<dyn ConnectorFactory<C>>, runner: TaskRunner) -> PortBindings<C> {
        PortBindings {
            inner: Arc::new(Inner {
                module_id,
                attempt_wait,
                factory,
                runner,
                state: Mutex::new(BindingsState {
                    session: None,
                    ports: FxHashMap::default(),
                }),
            }),
        }
    }

    /// Binds a virtual port. `backlog` limits the connections that are requested, in progress or
    ///  waiting to be accepted at any given time.
    pub fn listen(&self, virtual_port: i32, backlog: usize, socket_options: SocketOptions) -> Result<(), RequestError> {
        if backlog == 0 {
            return Err(RequestError::InvalidArgument("backlog must be positive".to_string()));
        }

        let mut state = self.inner.state.lock();
        if state.ports.contains_key(&virtual_port) {
            return Err(RequestError::InvalidArgument(format!("virtual port {} is already bound", virtual_port)));
        }

        debug!(virtual_port, backlog, "binding virtual port");
        state.ports.insert(virtual_port, Binding {
            backlog,
            socket_options,
            requested: FxHashMap::default(),
            pending: FxHashMap::default(),
            ready: VecDeque::new(),
            handler: None,
        });
        Ok(())
    }

    /// Unbinds a virtual port, aborting its connection attempts and closing connections that were
    ///  not accepted yet
    pub fn release_port(&self, virtual_port: i32) {
        if let Some(mut binding) = self.inner.state.lock().ports.remove(&virtual_port) {
            debug!(virtual_port, "releasing virtual port");
            binding.abort_all();
        }
    }

    /// Registers the handler for a port's connections. Connections that were established before
    ///  are passed to it right away.
    pub fn accept(&self, virtual_port: i32, handler: impl Fn(AcceptedConnection<C>) + Send + Sync + 'static) -> Result<(), RequestError> {
        let mut state = self.inner.state.lock();
        let Some(binding) = state.ports.get_mut(&virtual_port) else {
            return Err(RequestError::PortUnreachable(virtual_port));
        };

        let handler: AcceptHandler<C> = Arc::new(handler);
        for connection in binding.ready.drain(..) {
            let handler = handler.clone();
            self.inner.runner.execute(move || handler(connection));
        }
        binding.handler = Some(handler);
        Ok(())
    }

    pub fn on_message(&self, message: SessionMessage) -> anyhow::Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        match message {
            SessionMessage::IncomingRequest { request_id, client_id, virtual_port, session_tag } => {
                let reply = match state.ports.get_mut(&virtual_port) {
                    None => {
                        debug!(?request_id, virtual_port, "request for unbound virtual port");
                        SessionMessage::RequestError { request_id, code: error_code::PORT_UNREACHABLE }
                    }
                    Some(binding) if binding.is_full() => {
                        debug!(?request_id, virtual_port, "backlog is full");
                        SessionMessage::RequestError { request_id, code: error_code::SERVICE_BUSY }
                    }
                    Some(binding) => {
                        let expiry = inner.schedule_request_expiry(virtual_port, request_id);
                        binding.requested.insert(request_id, IncomingRequest { client_id, session_tag, expiry });
                        SessionMessage::RequestOk { request_id, virtual_port }
                    }
                };
                inner.send(&state, reply);
            }
            SessionMessage::ServiceRzvData { request_id, virtual_port, connection_id, server_id, server_ip } => {
                let Some(binding) = state.ports.get_mut(&virtual_port) else {
                    trace!(?request_id, virtual_port, "routing data for unbound port");
                    return Ok(());
                };
                let Some(request) = binding.requested.remove(&request_id) else {
                    debug!(?request_id, "routing data for unknown or expired request");
                    return Ok(());
                };
                request.expiry.cancel();
                let options = binding.socket_options;
                let pending = inner.start_attempt(request_id, request, virtual_port, connection_id, server_id, server_ip, options);
                binding.pending.insert(connection_id, pending);
            }
            SessionMessage::ServiceAuthHash { virtual_port, connection_id, hash, key } => {
                match state.ports.get(&virtual_port).and_then(|b| b.pending.get(&connection_id)) {
                    Some(pending) => pending.connector.on_authentication_hash(hash, key),
                    None => debug!(virtual_port, ?connection_id, "no connection attempt for authentication hash"),
                }
            }
            SessionMessage::ServiceAuthError { virtual_port, connection_id } => {
                if let Some(pending) = state.ports.get_mut(&virtual_port).and_then(|b| b.pending.remove(&connection_id)) {
                    debug!(virtual_port, ?connection_id, "client failed authentication");
                    pending.abort();
                }
            }
            other => bail!("unexpected message for module {:?}: {:?}", inner.module_id, other),
        }
        Ok(())
    }

    pub fn on_session_connected(&self, session: Arc<dyn SessionChannel>) {
        self.inner.state.lock().session = Some(session);
    }

    /// Aborts all connection attempts. Port bindings survive, so that clients can connect again
    ///  once the session is reestablished.
    pub fn on_session_disconnected(&self) {
        let mut state = self.inner.state.lock();
        state.session = None;
        for binding in state.ports.values_mut() {
            binding.abort_all();
        }
    }

    pub fn on_endpoint_closed(&self) {
        let mut state = self.inner.state.lock();
        state.session = None;
        for (_, mut binding) in state.ports.drain() {
            binding.abort_all();
        }
    }

    /// Connection attempts in progress for a port
    pub fn pending_connections(&self, virtual_port: i32) -> usize {
        self.inner.state.lock().ports.get(&virtual_port)
            .map(|b| b.pending.len())
            .unwrap_or(0)
    }
}

impl<C: Send + 'static> Inner<C> {
    #[allow(clippy::too_many_arguments)]
    fn start_attempt(self: &Arc<Self>, request_id: RequestId, request: IncomingRequest, virtual_port: i32, connection_id: ConnectionId, server_id: i32, server_ip: IpAddr, options: SocketOptions) -> PendingAccept {
        debug!(?request_id, virtual_port, ?connection_id, ?server_ip, "starting connection attempt");

        let (events, receiver) = mpsc::unbounded_channel();
        let connector = self.factory.start(ConnectorArgs {
            role: Role::Service,
            connection_id,
            server_ip,
            options,
        }, events);
        self.runner.spawn(Self::forward_connector_events(Arc::downgrade(self), virtual_port, connection_id, receiver));

        let weak = Arc::downgrade(self);
        let timeout = self.runner.schedule(self.attempt_wait, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(virtual_port, connection_id);
            }
        });

        PendingAccept {
            request_id,
            client_id: request.client_id,
            session_tag: request.session_tag,
            server_id,
            connector,
            timeout,
        }
    }

    fn schedule_request_expiry(self: &Arc<Self>, virtual_port: i32, request_id: RequestId) -> Arc<ScheduledTask> {
        let weak = Arc::downgrade(self);
        self.runner.schedule(self.attempt_wait, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_request_expired(virtual_port, request_id);
            }
        })
    }

    fn on_request_expired(&self, virtual_port: i32, request_id: RequestId) {
        let mut state = self.state.lock();
        if state.ports.get_mut(&virtual_port).and_then(|b| b.requested.remove(&request_id)).is_some() {
            debug!(?request_id, virtual_port, "no routing data for acknowledged request - freeing backlog slot");
        }
    }

    async fn forward_connector_events(inner: Weak<Inner<C>>, virtual_port: i32, connection_id: ConnectionId, mut events: mpsc::UnboundedReceiver<ConnectorEvent<C>>) {
        while let Some(event) = events.recv().await {
            let Some(bindings) = inner.upgrade() else {
                return;
            };
            bindings.on_connector_event(virtual_port, connection_id, event);
        }
    }

    fn on_connector_event(&self, virtual_port: i32, connection_id: ConnectionId, event: ConnectorEvent<C>) {
        let mut state = self.state.lock();

        match event {
            ConnectorEvent::AuthKey(key) => {
                let Some(pending) = state.ports.get(&virtual_port).and_then(|b| b.pending.get(&connection_id)) else {
                    return;
                };
                let message = SessionMessage::ServiceAuthKey { virtual_port, connection_id, server_id: pending.server_id, key };
                self.send(&state, message);
            }
            ConnectorEvent::Connected { connection, mode } => {
                let Some(binding) = state.ports.get_mut(&virtual_port) else {
                    debug!(virtual_port, "port was released - closing connection");
                    return;
                };
                let Some(pending) = binding.pending.remove(&connection_id) else {
                    debug!(virtual_port, ?connection_id, "connection attempt is gone - closing connection");
                    return;
                };
                if !pending.timeout.cancel() {
                    debug!(virtual_port, ?connection_id, "connection attempt timed out concurrently");
                    return;
                }

                info!(virtual_port, client_id = pending.client_id, ?mode, "accepted connection");
                let accepted = AcceptedConnection {
                    connection,
                    mode,
                    client_id: pending.client_id,
                    session_tag: pending.session_tag,
                };
                match binding.handler.clone() {
                    Some(handler) => self.runner.execute(move || handler(accepted)),
                    None => binding.ready.push_back(accepted),
                }
                self.send(&state, SessionMessage::ConnectionAccepted { request_id: pending.request_id });
            }
            ConnectorEvent::Failed(e) => {
                if let Some(pending) = state.ports.get_mut(&virtual_port).and_then(|b| b.pending.remove(&connection_id)) {
                    debug!(virtual_port, ?connection_id, "connection attempt failed: {:#}", e);
                    pending.abort();
                }
            }
        }
    }

    fn on_timeout(&self, virtual_port: i32, connection_id: ConnectionId) {
        let mut state = self.state.lock();
        if let Some(pending) = state.ports.get_mut(&virtual_port).and_then(|b| b.pending.remove(&connection_id)) {
            info!(virtual_port, ?connection_id, "incoming connection attempt timed out");
            pending.connector.abort();
        }
    }

    fn send(&self, state: &BindingsState<C>, message: SessionMessage) {
        match &state.session {
            Some(session) => {
                if let Err(e) = session.send(message.encode(self.module_id)) {
                    debug!("error sending {:?}: {}", message, e);
                }
            }
            None => debug!("no session - dropping {:?}", message),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;
    use crate::test_util::session::{FakeConnectorFactory, TrackingSessionChannel};

    const PORT: i32 = 7;
    const CLIENT_ID: i64 = 99;
    const CONNECTION_ID: ConnectionId = ConnectionId([4; 16]);

    struct Fixture {
        bindings: PortBindings<u32>,
        session: Arc<TrackingSessionChannel>,
        factory: Arc<FakeConnectorFactory<u32>>,
    }
    impl Fixture {
        fn new() -> Fixture {
            let factory = FakeConnectorFactory::<u32>::new();
            let bindings = PortBindings::<u32>::new(ModuleId::ServiceTcp, Duration::from_secs(30), factory.clone(), TaskRunner::current().unwrap());
            let session = TrackingSessionChannel::new();
            bindings.on_session_connected(session.clone());
            Fixture { bindings, session, factory }
        }

        fn incoming(&self, request_id: RequestId) -> SessionMessage {
            self.bindings.on_message(SessionMessage::IncomingRequest {
                request_id,
                client_id: CLIENT_ID,
                virtual_port: PORT,
                session_tag: Some(Bytes::from_static(b"tag")),
            }).unwrap();
            self.session.assert_single_message().1
        }

        fn rzv_data(&self, request_id: RequestId) {
            self.bindings.on_message(SessionMessage::ServiceRzvData {
                request_id,
                virtual_port: PORT,
                connection_id: CONNECTION_ID,
                server_id: 5,
                server_ip: "127.0.0.1".parse().unwrap(),
            }).unwrap();
        }

        fn accepted_channel(&self) -> UnboundedReceiver<AcceptedConnection<u32>> {
            let (send, recv) = mpsc::unbounded_channel();
            self.bindings.accept(PORT, move |c| { let _ = send.send(c); }).unwrap();
            recv
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_request_for_unbound_port() {
        let fixture = Fixture::new();
        let request_id = RequestId::new_v4();
        assert_eq!(fixture.incoming(request_id), SessionMessage::RequestError { request_id, code: error_code::PORT_UNREACHABLE });
    }

    #[tokio::test]
    async fn test_backlog() {
        let fixture = Fixture::new();
        fixture.bindings.listen(PORT, 1, SocketOptions::default()).unwrap();

        let first = RequestId::new_v4();
        assert_eq!(fixture.incoming(first), SessionMessage::RequestOk { request_id: first, virtual_port: PORT });
        let second = RequestId::new_v4();
        assert_eq!(fixture.incoming(second), SessionMessage::RequestError { request_id: second, code: error_code::SERVICE_BUSY });
    }

    #[tokio::test]
    async fn test_listen_validation() {
        let fixture = Fixture::new();
        assert!(matches!(fixture.bindings.listen(PORT, 0, SocketOptions::default()), Err(RequestError::InvalidArgument(_))));
        fixture.bindings.listen(PORT, 3, SocketOptions::default()).unwrap();
        assert!(matches!(fixture.bindings.listen(PORT, 3, SocketOptions::default()), Err(RequestError::InvalidArgument(_))));
        assert_eq!(fixture.bindings.accept(PORT + 1, |_| {}).unwrap_err(), RequestError::PortUnreachable(PORT + 1));
    }

    #[tokio::test]
    async fn test_accept_connection() {
        let fixture = Fixture::new();
        fixture.bindings.listen(PORT, 3, SocketOptions::default()).unwrap();
        let mut accepted = fixture.accepted_channel();

        let request_id = RequestId::new_v4();
        fixture.incoming(request_id);
        fixture.rzv_data(request_id);
        let connector = fixture.factory.connector(0);
        assert_eq!(connector.args.role, Role::Service);
        assert_eq!(connector.args.connection_id, CONNECTION_ID);
        assert_eq!(fixture.bindings.pending_connections(PORT), 1);

        connector.established(17, ConnectionMode::Proxy);
        let connection = accepted.recv().await.unwrap();
        assert_eq!(connection.connection, 17);
        assert_eq!(connection.mode, ConnectionMode::Proxy);
        assert_eq!(connection.client_id, CLIENT_ID);
        assert_eq!(connection.session_tag, Some(Bytes::from_static(b"tag")));

        assert_eq!(fixture.session.assert_single_message(), (ModuleId::ServiceTcp, SessionMessage::ConnectionAccepted { request_id }));
        assert_eq!(fixture.bindings.pending_connections(PORT), 0);
        assert!(!connector.is_aborted());
    }

    #[tokio::test]
    async fn test_connections_are_queued_until_accepted() {
        let fixture = Fixture::new();
        fixture.bindings.listen(PORT, 3, SocketOptions::default()).unwrap();

        let request_id = RequestId::new_v4();
        fixture.incoming(request_id);
        fixture.rzv_data(request_id);
        fixture.factory.connector(0).established(3, ConnectionMode::P2P);
        settle().await;
        assert_eq!(fixture.session.assert_single_message().1, SessionMessage::ConnectionAccepted { request_id });

        let mut accepted = fixture.accepted_channel();
        assert_eq!(accepted.recv().await.unwrap().connection, 3);
    }

    #[tokio::test]
    async fn test_authentication_relay() {
        let fixture = Fixture::new();
        fixture.bindings.listen(PORT, 3, SocketOptions::default()).unwrap();
        let request_id = RequestId::new_v4();
        fixture.incoming(request_id);
        fixture.rzv_data(request_id);
        let connector = fixture.factory.connector(0);

        connector.auth_key([8; 20]);
        settle().await;
        assert_eq!(fixture.session.assert_single_message().1, SessionMessage::ServiceAuthKey { virtual_port: PORT, connection_id: CONNECTION_ID, server_id: 5, key: [8; 20] });

        fixture.bindings.on_message(SessionMessage::ServiceAuthHash { virtual_port: PORT, connection_id: CONNECTION_ID, hash: [1; 20], key: [2; 20] }).unwrap();
        assert_eq!(connector.auth_hashes(), vec![([1; 20], [2; 20])]);

        fixture.bindings.on_message(SessionMessage::ServiceAuthError { virtual_port: PORT, connection_id: CONNECTION_ID }).unwrap();
        assert!(connector.is_aborted());
        assert_eq!(fixture.bindings.pending_connections(PORT), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_frees_backlog() {
        let fixture = Fixture::new();
        fixture.bindings.listen(PORT, 1, SocketOptions::default()).unwrap();
        let request_id = RequestId::new_v4();
        fixture.incoming(request_id);
        fixture.rzv_data(request_id);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(fixture.factory.connector(0).is_aborted());

        let next = RequestId::new_v4();
        assert_eq!(fixture.incoming(next), SessionMessage::RequestOk { request_id: next, virtual_port: PORT });
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_without_routing_data_expires() {
        let fixture = Fixture::new();
        fixture.bindings.listen(PORT, 1, SocketOptions::default()).unwrap();
        let abandoned = RequestId::new_v4();
        assert_eq!(fixture.incoming(abandoned), SessionMessage::RequestOk { request_id: abandoned, virtual_port: PORT });

        tokio::time::sleep(Duration::from_secs(10)).await;
        let early = RequestId::new_v4();
        assert_eq!(fixture.incoming(early), SessionMessage::RequestError { request_id: early, code: error_code::SERVICE_BUSY });

        tokio::time::sleep(Duration::from_secs(21)).await;
        let next = RequestId::new_v4();
        assert_eq!(fixture.incoming(next), SessionMessage::RequestOk { request_id: next, virtual_port: PORT });

        // routing data for the expired request starts nothing
        fixture.rzv_data(abandoned);
        assert_eq!(fixture.factory.num_started(), 0);
        assert_eq!(fixture.bindings.pending_connections(PORT), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_data_stops_request_expiry() {
        let fixture = Fixture::new();
        fixture.bindings.listen(PORT, 3, SocketOptions::default()).unwrap();
        let request_id = RequestId::new_v4();
        fixture.incoming(request_id);
        tokio::time::sleep(Duration::from_secs(20)).await;
        fixture.rzv_data(request_id);

        // the attempt gets its own full wait time
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!fixture.factory.connector(0).is_aborted());
        assert_eq!(fixture.bindings.pending_connections(PORT), 1);
    }

    #[tokio::test]
    async fn test_release_port_aborts_attempts() {
        let fixture = Fixture::new();
        fixture.bindings.listen(PORT, 3, SocketOptions::default()).unwrap();
        let request_id = RequestId::new_v4();
        fixture.incoming(request_id);
        fixture.rzv_data(request_id);

        fixture.bindings.release_port(PORT);
        assert!(fixture.factory.connector(0).is_aborted());

        // a connection that is established anyway is not accepted
        fixture.factory.connector(0).established(1, ConnectionMode::P2P);
        settle().await;
        fixture.session.assert_no_remaining_messages();
    }

    #[tokio::test]
    async fn test_session_disconnect_keeps_bindings() {
        let fixture = Fixture::new();
        fixture.bindings.listen(PORT, 3, SocketOptions::default()).unwrap();
        let request_id = RequestId::new_v4();
        fixture.incoming(request_id);
        fixture.rzv_data(request_id);

        fixture.bindings.on_session_disconnected();
        assert!(fixture.factory.connector(0).is_aborted());
        assert_eq!(fixture.bindings.pending_connections(PORT), 0);

        fixture.bindings.on_session_connected(fixture.session.clone());
        let next = RequestId::new_v4();
        assert_eq!(fixture.incoming(next), SessionMessage::RequestOk { request_id: next, virtual_port: PORT });
    }

    #[tokio::test]
    async fn test_unexpected_message() {
        let fixture = Fixture::new();
        assert!(fixture.bindings.on_message(SessionMessage::ConnectionAccepted { request_id: RequestId::new_v4() }).is_err());
    }
}
