use std::sync::Arc;
use anyhow::Context;
use tracing::{debug, info};

use crate::config::EndpointConfig;
use crate::connector::sockets::{ReuseAddrSockets, SocketProvider};
use crate::connector::tcp_connector::TcpConnectorFactory;
use crate::connector::udp_connector::UdpConnectorFactory;
use crate::controller::connect_controller::{TcpController, UdpController};
use crate::controller::rpc_controller::RpcController;
use crate::messaging::session::SessionChannel;
use crate::messaging::session_messages::{ModuleId, SessionMessage};
use crate::runtime::TaskRunner;
use crate::service::port_binding::{TcpPortBindings, UdpPortBindings};

/// The connection establishment part of an endpoint: client side controllers for TCP, UDP and RPC
///  requests, and service side port bindings for TCP and UDP.
///
/// The endpoint does not own the session. The session's owner reports lifecycle changes and
///  passes the messages it receives for the connection modules to [Endpoint::on_session_message].
pub struct Endpoint {
    tcp: TcpController,
    udp: UdpController,
    rpc: RpcController,
    tcp_bindings: TcpPortBindings,
    udp_bindings: UdpPortBindings,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, runner: TaskRunner) -> anyhow::Result<Endpoint> {
        Endpoint::with_sockets(config, Arc::new(ReuseAddrSockets), runner)
    }

    pub fn with_sockets(config: EndpointConfig, sockets: Arc<dyn SocketProvider>, runner: TaskRunner) -> anyhow::Result<Endpoint> {
        config.validate()
            .context("invalid endpoint configuration")?;
        let config = Arc::new(config);

        let tcp_factory = Arc::new(TcpConnectorFactory::new(config.clone(), sockets.clone(), runner.clone()));
        let udp_factory = Arc::new(UdpConnectorFactory::new(config.clone(), sockets, runner.clone()));

        Ok(Endpoint {
            tcp: TcpController::new(ModuleId::ClientTcp, config.tcp_connect_wait, tcp_factory.clone(), runner.clone()),
            udp: UdpController::new(ModuleId::ClientUdp, config.udp_connect_wait, udp_factory.clone(), runner.clone()),
            rpc: RpcController::new(config.rpc_wait, runner.clone()),
            tcp_bindings: TcpPortBindings::new(ModuleId::ServiceTcp, config.tcp_connect_wait, tcp_factory, runner.clone()),
            udp_bindings: UdpPortBindings::new(ModuleId::ServiceUdp, config.udp_connect_wait, udp_factory, runner),
        })
    }

    pub fn tcp(&self) -> &TcpController {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpController {
        &self.udp
    }

    pub fn rpc(&self) -> &RpcController {
        &self.rpc
    }

    pub fn tcp_bindings(&self) -> &TcpPortBindings {
        &self.tcp_bindings
    }

    pub fn udp_bindings(&self) -> &UdpPortBindings {
        &self.udp_bindings
    }

    pub fn on_session_connected(&self, session: Arc<dyn SessionChannel>) {
        debug!("session connected");
        self.tcp.on_session_connected(session.clone());
        self.udp.on_session_connected(session.clone());
        self.rpc.on_session_connected(session.clone());
        self.tcp_bindings.on_session_connected(session.clone());
        self.udp_bindings.on_session_connected(session);
    }

    /// The server accepted this endpoint, so requests can be sent
    pub fn on_session_online(&self) {
        info!("session is online");
        self.tcp.on_session_online();
        self.udp.on_session_online();
        self.rpc.on_session_online();
    }

    pub fn on_session_disconnected(&self) {
        info!("session disconnected");
        self.tcp.on_session_disconnected();
        self.udp.on_session_disconnected();
        self.rpc.on_session_disconnected();
        self.tcp_bindings.on_session_disconnected();
        self.udp_bindings.on_session_disconnected();
    }

    /// The application closes the endpoint: everything is torn down, and pending requests are
    ///  dropped without notifying their handlers
    pub fn on_endpoint_closed(&self) {
        info!("endpoint closed");
        self.tcp.on_endpoint_closed();
        self.udp.on_endpoint_closed();
        self.rpc.on_endpoint_closed();
        self.tcp_bindings.on_endpoint_closed();
        self.udp_bindings.on_endpoint_closed();
    }

    pub fn on_remote_service_offline(&self, service_id: i64) {
        debug!(service_id, "remote service went offline");
        self.tcp.on_remote_service_offline(service_id);
        self.udp.on_remote_service_offline(service_id);
        self.rpc.on_remote_service_offline(service_id);
    }

    /// Routes a session message to its module. An error means the session's peer violated the
    ///  protocol, and the session should be closed.
    pub fn on_session_message(&self, raw: &[u8]) -> anyhow::Result<()> {
        let (module_id, message) = SessionMessage::decode(raw)?;
        match module_id {
            ModuleId::ClientTcp => self.tcp.on_message(message),
            ModuleId::ClientUdp => self.udp.on_message(message),
            ModuleId::ClientRpc => self.rpc.on_message(message),
            ModuleId::ServiceTcp => self.tcp_bindings.on_message(message),
            ModuleId::ServiceUdp => self.udp_bindings.on_message(message),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use crate::config::SocketOptions;
    use crate::connector::wire::{proxy_header, AttemptMessage, ConnectorTag, TcpServerMessage};
    use crate::connector::{ConnectionMode, Role};
    use crate::controller::request::RequestParams;
    use crate::error::{error_code, RequestError};
    use crate::messaging::endpoint_addr::{AddressFamily, ConnectionId};
    use crate::messaging::session_messages::RequestId;
    use crate::test_util::fake_rendezvous::{test_config, FakeRendezvous};
    use crate::test_util::session::{TestService, TrackingSessionChannel};
    use crate::test_util::sockets::NoReuseSockets;

    fn online_endpoint(config: EndpointConfig, sockets: Arc<dyn SocketProvider>) -> (Endpoint, Arc<TrackingSessionChannel>) {
        let endpoint = Endpoint::with_sockets(config, sockets, TaskRunner::current().unwrap()).unwrap();
        let session = TrackingSessionChannel::new();
        endpoint.on_session_connected(session.clone());
        endpoint.on_session_online();
        (endpoint, session)
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = EndpointConfig { hole_punch_attempts: 0, ..Default::default() };
        assert!(Endpoint::new(config, TaskRunner::current().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_tcp_connect_through_relay() {
        let server = FakeRendezvous::bind().await;
        let (endpoint, session) = online_endpoint(test_config(server.port(), server.port()), Arc::new(NoReuseSockets));

        let (send, mut outcomes) = mpsc::unbounded_channel();
        endpoint.tcp().connect(TestService::new(1), 80, RequestParams::default(), move |_, outcome| {
            let _ = send.send(outcome);
        });
        let request_id = match session.assert_single_message() {
            (ModuleId::ClientTcp, SessionMessage::Request { request_id, service_id: 1, virtual_port: 80, .. }) => request_id,
            other => panic!("expected request, was {:?}", other),
        };

        let connection_id = ConnectionId([0x31; 16]);
        endpoint.on_session_message(&SessionMessage::RzvData {
            request_id,
            connection_id,
            server_id: 2,
            server_ip: "127.0.0.1".parse().unwrap(),
        }.encode(ModuleId::ClientTcp)).unwrap();

        let mut control = server.accept().await;
        assert_eq!(AttemptMessage::tag(&control.recv().await), Some(ConnectorTag::ClientProxy));
        let relay = server.relay(proxy_header(Role::Client, &connection_id)).await;
        control.send(TcpServerMessage::CreateProxyConnection { relay_port: relay.port() }.encode(AddressFamily::V4)).await;
        let mut relayed = relay.accepted().await;

        endpoint.on_session_message(&SessionMessage::ConnectionAccepted { request_id }.encode(ModuleId::ClientTcp)).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv()).await.unwrap().unwrap();
        let mut connection = outcome.unwrap();
        assert_eq!(connection.mode, ConnectionMode::Proxy);

        connection.connection.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        relayed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn test_service_messages_are_routed_to_bindings() {
        let (endpoint, session) = online_endpoint(EndpointConfig::default(), Arc::new(ReuseAddrSockets));
        endpoint.udp_bindings().listen(9, 4, SocketOptions::default()).unwrap();

        let request_id = RequestId::new_v4();
        endpoint.on_session_message(&SessionMessage::IncomingRequest { request_id, client_id: 3, virtual_port: 9, session_tag: None }.encode(ModuleId::ServiceUdp)).unwrap();
        assert_eq!(session.assert_single_message(), (ModuleId::ServiceUdp, SessionMessage::RequestOk { request_id, virtual_port: 9 }));

        endpoint.on_session_message(&SessionMessage::IncomingRequest { request_id, client_id: 3, virtual_port: 9, session_tag: None }.encode(ModuleId::ServiceTcp)).unwrap();
        assert_eq!(session.assert_single_message(), (ModuleId::ServiceTcp, SessionMessage::RequestError { request_id, code: error_code::PORT_UNREACHABLE }));
    }

    #[tokio::test]
    async fn test_rpc_round_trip() {
        let (endpoint, session) = online_endpoint(EndpointConfig::default(), Arc::new(ReuseAddrSockets));
        let (send, mut results) = mpsc::unbounded_channel();
        endpoint.rpc().call(TestService::new(5), "echo", Bytes::from_static(b"x"), RequestParams::default(), move |_, result| {
            let _ = send.send(result);
        });
        let request_id = match session.assert_single_message() {
            (ModuleId::ClientRpc, SessionMessage::RpcRequest { request_id, .. }) => request_id,
            other => panic!("expected call, was {:?}", other),
        };

        endpoint.on_session_message(&SessionMessage::RpcResult { request_id, result: Bytes::from_static(b"x") }.encode(ModuleId::ClientRpc)).unwrap();
        assert_eq!(results.recv().await.unwrap(), Ok(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn test_lifecycle_fans_out() {
        let (endpoint, _session) = online_endpoint(EndpointConfig::default(), Arc::new(ReuseAddrSockets));
        let (send, mut outcomes) = mpsc::unbounded_channel();
        let udp_send = send.clone();
        endpoint.udp().connect(TestService::new(1), 1, RequestParams::default(), move |_, outcome| {
            let _ = udp_send.send(outcome.map(|_| ()));
        });
        endpoint.tcp().connect(TestService::new(2), 1, RequestParams::default(), move |_, outcome| {
            let _ = send.send(outcome.map(|_| ()));
        });

        endpoint.on_remote_service_offline(1);
        assert_eq!(outcomes.recv().await.unwrap(), Err(RequestError::ServiceOffline));
        endpoint.on_session_disconnected();
        assert_eq!(outcomes.recv().await.unwrap(), Err(RequestError::ClientOffline));
        assert_eq!(endpoint.tcp().pending_requests() + endpoint.udp().pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_protocol_violations() {
        let (endpoint, _session) = online_endpoint(EndpointConfig::default(), Arc::new(ReuseAddrSockets));
        assert!(endpoint.on_session_message(&[]).is_err());
        assert!(endpoint.on_session_message(&[99, 1]).is_err());
        assert!(endpoint.on_session_message(&SessionMessage::RpcResult { request_id: RequestId::new_v4(), result: Bytes::new() }.encode(ModuleId::ClientTcp)).is_err());
    }
}
