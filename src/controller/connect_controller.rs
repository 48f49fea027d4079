use std::sync::{Arc, Weak};
use std::time::Duration;
use anyhow::bail;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::config::{EndpointConfig, SocketOptions};
use crate::connector::udp_connector::UdpConnection;
use crate::connector::{ConnectionMode, ConnectorArgs, ConnectorEvent, ConnectorFactory, ConnectorHandle, Role};
use crate::controller::completion::CompletionRace;
use crate::controller::request::{Attachment, PendingRequest, RequestParams, RequestTable, ResponseContext};
use crate::error::{RequestError, RequestTarget};
use crate::messaging::session::{RemoteService, SessionChannel};
use crate::messaging::session_messages::{ModuleId, RequestId, SessionMessage};
use crate::runtime::{ScheduledTask, TaskRunner};

pub type TcpController = ConnectController<TcpStream>;
pub type UdpController = ConnectController<UdpConnection>;

#[derive(Debug)]
pub struct Connection<C> {
    pub connection: C,
    pub mode: ConnectionMode,
}

pub type ConnectResult<C> = Result<Connection<C>, RequestError>;

type ConnectHandler<C> = Box<dyn FnOnce(ResponseContext, ConnectResult<C>) + Send>;

struct PendingConnect<C> {
    service: Arc<dyn RemoteService>,
    attachment: Option<Attachment>,
    virtual_port: i32,
    socket_options: SocketOptions,
    handler: ConnectHandler<C>,
    timeout: Arc<ScheduledTask>,
    /// the rendezvous server handling the connection attempt, known after routing data arrived
    server_id: i32,
    connector: Option<Arc<dyn ConnectorHandle>>,
    race: CompletionRace<Connection<C>>,
}

impl<C> PendingRequest for PendingConnect<C> {
    fn service_id(&self) -> i64 {
        self.service.service_id()
    }

    fn timeout(&self) -> &ScheduledTask {
        &self.timeout
    }
}

/// Tracks connect requests from this client to remote services, for one transport protocol.
///
/// A request is sent to the rendezvous server over the session. The server responds with routing
///  data for a connection attempt, which the controller hands to a connector. The request
///  completes successfully when the connector has established a connection and the service has
///  accepted it, in either order. It fails when the server reports an error, the connection
///  attempt fails, the session goes down, the service goes offline, or the wait time expires.
pub struct ConnectController<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for ConnectController<C> {
    fn clone(&self) -> Self {
        ConnectController { inner: self.inner.clone() }
    }
}

struct Inner<C> {
    module_id: ModuleId,
    default_wait: Duration,
    factory: Arc<dyn ConnectorFactory<C>>,
    runner: TaskRunner,
    requests: Mutex<RequestTable<PendingConnect<C>>>,
}

impl<C: Send + 'static> ConnectController<C> {
    pub fn new(module_id: ModuleId, default_wait: Duration, factory: Arc<dyn ConnectorFactory<C>>, runner: TaskRunner) -> ConnectController<C> {
        ConnectController {
            inner: Arc::new(Inner {
                module_id,
                default_wait,
                factory,
                runner,
                requests: Mutex::new(RequestTable::new()),
            }),
        }
    }

    /// Requests a connection to a virtual port of a remote service. The handler is called exactly
    ///  once: synchronously if the request can not be sent, asynchronously otherwise.
    pub fn connect(&self, service: Arc<dyn RemoteService>, virtual_port: i32, params: RequestParams, handler: impl FnOnce(ResponseContext, ConnectResult<C>) + Send + 'static) {
        let precondition = params.validate()
            .and_then(|_| if service.is_online() { Ok(()) } else { Err(RequestError::ServiceOffline) });
        if let Err(e) = precondition {
            debug!("rejecting connect request: {}", e);
            handler(ResponseContext { service, attachment: params.attachment }, Err(e));
            return;
        }

        let mut requests = self.inner.requests.lock();
        let Some(session) = requests.online_session() else {
            drop(requests);
            debug!("rejecting connect request: session is not online");
            handler(ResponseContext { service, attachment: params.attachment }, Err(RequestError::ClientOffline));
            return;
        };

        let request_id = requests.new_request_id();
        let service_id = service.service_id();
        let wait = EndpointConfig::effective_wait(self.inner.default_wait, params.wait_seconds);
        let timeout = self.inner.schedule_timeout(request_id, wait);

        requests.insert(request_id, PendingConnect {
            service,
            attachment: params.attachment,
            virtual_port,
            socket_options: params.socket_options,
            handler: Box::new(handler),
            timeout,
            server_id: 0,
            connector: None,
            race: CompletionRace::default(),
        });

        debug!(?request_id, service_id, virtual_port, "requesting connection");
        let message = SessionMessage::Request {
            request_id,
            service_id,
            virtual_port,
            session_tag: params.session_tag,
        };
        if let Err(e) = session.send(message.encode(self.inner.module_id)) {
            debug!(?request_id, "error sending connect request: {}", e);
            if let Some(pending) = requests.remove(&request_id) {
                self.inner.deliver(pending, Err(RequestError::ClientOffline));
            }
        }
    }

    /// Handles a message addressed to this controller's module. An error means the message
    ///  violates the protocol, which is fatal for the session.
    pub fn on_message(&self, message: SessionMessage) -> anyhow::Result<()> {
        let inner = &self.inner;
        let mut requests = inner.requests.lock();

        match message {
            SessionMessage::RzvData { request_id, connection_id, server_id, server_ip } => {
                let Some(pending) = requests.get_mut(&request_id) else {
                    trace!(?request_id, "routing data for a request that is gone");
                    return Ok(());
                };
                if pending.connector.is_some() {
                    debug!(?request_id, "ignoring repeated routing data");
                    return Ok(());
                }

                debug!(?request_id, ?connection_id, ?server_ip, "starting connection attempt");
                let (events, receiver) = mpsc::unbounded_channel();
                pending.server_id = server_id;
                pending.connector = Some(inner.factory.start(ConnectorArgs {
                    role: Role::Client,
                    connection_id,
                    server_ip,
                    options: pending.socket_options,
                }, events));
                inner.runner.spawn(Inner::forward_connector_events(Arc::downgrade(inner), request_id, receiver));
            }
            SessionMessage::ConnectionAccepted { request_id } => {
                let Some(pending) = requests.get_mut(&request_id) else {
                    trace!(?request_id, "acceptance for a request that is gone");
                    return Ok(());
                };
                if let Some(connection) = pending.race.on_accepted() {
                    inner.complete(&mut requests, request_id, Ok(connection));
                }
            }
            SessionMessage::RequestError { request_id, code } => {
                let Some(pending) = requests.get_mut(&request_id) else {
                    trace!(?request_id, "error for a request that is gone");
                    return Ok(());
                };
                let error = RequestError::from_code(code, RequestTarget::VirtualPort(pending.virtual_port));
                inner.complete(&mut requests, request_id, Err(error));
            }
            SessionMessage::AuthHash { request_id, hash, key } => {
                match requests.get_mut(&request_id).and_then(|p| p.connector.as_ref()) {
                    Some(connector) => connector.on_authentication_hash(hash, key),
                    None => debug!(?request_id, "no connection attempt for authentication hash"),
                }
            }
            SessionMessage::AuthError { request_id } => {
                inner.complete(&mut requests, request_id, Err(RequestError::ConnectionAttemptFailed));
            }
            other => bail!("unexpected message for module {:?}: {:?}", inner.module_id, other),
        }
        Ok(())
    }

    pub fn on_session_connected(&self, session: Arc<dyn SessionChannel>) {
        self.inner.requests.lock().on_session_connected(session);
    }

    pub fn on_session_online(&self) {
        self.inner.requests.lock().on_session_online();
    }

    /// Fails all pending requests
    pub fn on_session_disconnected(&self) {
        let mut requests = self.inner.requests.lock();
        let removed = requests.on_session_closed();
        if !removed.is_empty() {
            info!("session disconnected - failing {} pending connect requests", removed.len());
        }
        for pending in removed {
            self.inner.deliver(pending, Err(RequestError::ClientOffline));
        }
    }

    /// Tears down all pending requests without notifying their handlers
    pub fn on_endpoint_closed(&self) {
        let mut requests = self.inner.requests.lock();
        for pending in requests.on_session_closed() {
            if let Some(connector) = &pending.connector {
                connector.abort();
            }
        }
    }

    pub fn on_remote_service_offline(&self, service_id: i64) {
        let mut requests = self.inner.requests.lock();
        for (request_id, pending) in requests.remove_for_service(service_id) {
            debug!(?request_id, service_id, "service went offline");
            self.inner.deliver(pending, Err(RequestError::ServiceOffline));
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.requests.lock().len()
    }
}

impl<C: Send + 'static> Inner<C> {
    fn schedule_timeout(self: &Arc<Self>, request_id: RequestId, wait: Duration) -> Arc<ScheduledTask> {
        let weak = Arc::downgrade(self);
        self.runner.schedule(wait, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(request_id);
            }
        })
    }

    fn on_timeout(&self, request_id: RequestId) {
        let mut requests = self.requests.lock();
        if let Some(pending) = requests.remove_for_timeout(&request_id) {
            info!(?request_id, "connect request timed out");
            self.deliver(pending, Err(RequestError::TimeoutExpired));
        }
    }

    async fn forward_connector_events(inner: Weak<Inner<C>>, request_id: RequestId, mut events: mpsc::UnboundedReceiver<ConnectorEvent<C>>) {
        while let Some(event) = events.recv().await {
            let Some(controller) = inner.upgrade() else {
                return;
            };
            controller.on_connector_event(request_id, event);
        }
    }

    fn on_connector_event(&self, request_id: RequestId, event: ConnectorEvent<C>) {
        let mut requests = self.requests.lock();

        match event {
            ConnectorEvent::AuthKey(key) => {
                let Some(server_id) = requests.get_mut(&request_id).map(|p| p.server_id) else {
                    return;
                };
                let message = SessionMessage::AuthKey { request_id, server_id, key };
                match requests.session() {
                    Some(session) => {
                        if let Err(e) = session.send(message.encode(self.module_id)) {
                            debug!(?request_id, "error sending authentication key: {}", e);
                        }
                    }
                    None => debug!(?request_id, "no session for sending authentication key"),
                }
            }
            ConnectorEvent::Connected { connection, mode } => {
                let Some(pending) = requests.get_mut(&request_id) else {
                    debug!(?request_id, "request is gone - closing established connection");
                    return;
                };
                debug!(?request_id, ?mode, "connection established");
                if let Some(connection) = pending.race.on_established(Connection { connection, mode }) {
                    self.complete(&mut requests, request_id, Ok(connection));
                }
            }
            ConnectorEvent::Failed(e) => {
                debug!(?request_id, "connection attempt failed: {:#}", e);
                self.complete(&mut requests, request_id, Err(RequestError::ConnectionAttemptFailed));
            }
        }
    }

    fn complete(&self, requests: &mut RequestTable<PendingConnect<C>>, request_id: RequestId, outcome: ConnectResult<C>) {
        if let Some(pending) = requests.remove_for_response(&request_id) {
            self.deliver(pending, outcome);
        }
    }

    /// Hands a removed request's outcome to its handler. A failed request's connection attempt is
    ///  aborted, closing all its sockets.
    fn deliver(&self, pending: PendingConnect<C>, outcome: ConnectResult<C>) {
        if outcome.is_err() {
            if let Some(connector) = &pending.connector {
                connector.abort();
            }
        }

        let context = ResponseContext {
            service: pending.service,
            attachment: pending.attachment,
        };
        let handler = pending.handler;
        self.runner.execute(move || handler(context, outcome));
    }
}
