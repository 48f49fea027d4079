use std::net::SocketAddr;
use std::time::Duration;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use crate::config::EndpointConfig;
use crate::connector::wire::PROXY_HEADER_LEN;
use crate::messaging::control_channel::{read_frame, write_frame};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FRAME_LEN: usize = 256;

/// Short timeouts so that fallback paths can be tested in real time
pub fn test_config(tcp_rzv_port: u16, udp_rzv_port: u16) -> EndpointConfig {
    EndpointConfig {
        tcp_rzv_port,
        udp_rzv_port,
        tcp_p2p_attempt_timeout: Duration::from_millis(300),
        udp_p2p_attempt_timeout: Duration::from_millis(300),
        udp_grace_period: Duration::from_millis(300),
        endpoint_info_initial_interval: Duration::from_millis(20),
        endpoint_info_max_interval: Duration::from_millis(160),
        hole_punch_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

pub async fn wait_for_no_open_sockets(open_sockets: impl Fn() -> usize) {
    for _ in 0..200 {
        if open_sockets() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} sockets are still open", open_sockets());
}

/// The server side of connection attempts' control connections, scripted by the test
pub struct FakeRendezvous {
    listener: TcpListener,
    udp: Option<UdpSocket>,
}
impl FakeRendezvous {
    pub async fn bind() -> FakeRendezvous {
        FakeRendezvous {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            udp: None,
        }
    }

    /// Binds a UDP socket and a TCP listener to the same port number
    pub async fn bind_with_udp() -> FakeRendezvous {
        for _ in 0..20 {
            let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = udp.local_addr().unwrap().port();
            if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
                return FakeRendezvous {
                    listener,
                    udp: Some(udp),
                };
            }
        }
        panic!("no port available for both TCP and UDP");
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub fn udp(&self) -> &UdpSocket {
        self.udp.as_ref().expect("bound without UDP")
    }

    pub async fn accept(&self) -> ControlConnection {
        let (stream, _) = tokio::time::timeout(TEST_TIMEOUT, self.listener.accept()).await
            .expect("timed out waiting for a control connection")
            .unwrap();
        ControlConnection { stream }
    }

    /// Receives a datagram on the server's UDP port
    pub async fn recv_datagram(&self) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 1024];
        let (len, from) = tokio::time::timeout(TEST_TIMEOUT, self.udp().recv_from(&mut buf)).await
            .expect("timed out waiting for a datagram")
            .unwrap();
        (buf[..len].to_vec(), from)
    }

    /// Starts a relay endpoint that expects the given proxy header and echoes it
    pub async fn relay(&self, expected_header: [u8; PROXY_HEADER_LEN]) -> Relay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut header = [0u8; PROXY_HEADER_LEN];
            stream.read_exact(&mut header).await.unwrap();
            assert_eq!(header, expected_header);
            stream.write_all(&header).await.unwrap();
            stream
        });
        Relay { port, handle }
    }

    /// An address nobody listens on
    pub async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }
}

pub struct Relay {
    port: u16,
    handle: JoinHandle<TcpStream>,
}
impl Relay {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn accepted(self) -> TcpStream {
        tokio::time::timeout(TEST_TIMEOUT, self.handle).await
            .expect("timed out waiting for a relayed connection")
            .unwrap()
    }
}

pub struct ControlConnection {
    stream: TcpStream,
}
impl ControlConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.stream.peer_addr().unwrap()
    }

    pub async fn recv(&mut self) -> Bytes {
        tokio::time::timeout(TEST_TIMEOUT, read_frame(&mut self.stream, MAX_FRAME_LEN)).await
            .expect("timed out waiting for a control message")
            .unwrap()
            .expect("control connection was closed")
    }

    pub async fn send(&mut self, frame: Bytes) {
        write_frame(&mut self.stream, &frame, MAX_FRAME_LEN).await.unwrap();
    }

    /// `true` if the connection attempt closed the control connection without sending anything
    ///  else
    pub async fn recv_eof(&mut self) -> bool {
        match tokio::time::timeout(TEST_TIMEOUT, read_frame(&mut self.stream, MAX_FRAME_LEN)).await {
            Ok(Ok(None)) | Ok(Err(_)) => true,
            Ok(Ok(Some(_))) | Err(_) => false,
        }
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}
