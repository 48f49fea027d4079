use std::time::Duration;
use anyhow::bail;

/// Requests may override their wait time, but never below this
pub const MIN_WAIT_TIME: Duration = Duration::from_secs(5);

pub struct EndpointConfig {
    /// port of the rendezvous server's TCP connector endpoint, used for the control connection
    ///  of TCP connection attempts
    pub tcp_rzv_port: u16,
    /// port of the rendezvous server's UDP connector endpoint. The same port number is used for
    ///  the control connection (TCP) and for endpoint announcements and relayed datagrams (UDP)
    pub udp_rzv_port: u16,

    pub tcp_connect_wait: Duration,
    pub udp_connect_wait: Duration,
    pub rpc_wait: Duration,

    /// Time the P2P phase of a TCP connection attempt may take before falling back to a proxy
    ///  connection
    pub tcp_p2p_attempt_timeout: Duration,
    pub udp_p2p_attempt_timeout: Duration,
    /// After requesting a relayed UDP connection (or after the last endpoint announcement), the
    ///  server has this much time to respond before the attempt fails
    pub udp_grace_period: Duration,

    pub endpoint_info_initial_interval: Duration,
    /// announcements are repeated with doubling intervals while the interval does not exceed this
    pub endpoint_info_max_interval: Duration,

    pub hole_punch_interval: Duration,
    pub hole_punch_attempts: u32,

    /// upper bound for connections a P2P listener accepts, protecting against misbehaving peers
    pub max_accepted_connections: usize,
    pub listener_backlog: u32,

    pub max_control_frame_len: usize,
}

impl EndpointConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tcp_rzv_port == 0 || self.udp_rzv_port == 0 {
            bail!("rendezvous ports must be configured");
        }
        if self.hole_punch_attempts == 0 {
            bail!("at least one hole punch attempt is required");
        }
        if self.max_accepted_connections == 0 {
            bail!("a P2P listener must accept at least one connection");
        }
        if self.endpoint_info_initial_interval.is_zero() || self.endpoint_info_initial_interval > self.endpoint_info_max_interval {
            bail!("endpoint info initial interval must be positive and not exceed the maximum interval");
        }
        if self.max_control_frame_len < 64 {
            bail!("control frames must allow at least 64 bytes");
        }
        Ok(())
    }

    /// An override of 0 means 'use the default', anything else is floored at [MIN_WAIT_TIME]
    pub fn effective_wait(default: Duration, wait_seconds_override: u32) -> Duration {
        if wait_seconds_override == 0 {
            default
        }
        else {
            Duration::from_secs(wait_seconds_override as u64).max(MIN_WAIT_TIME)
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            tcp_rzv_port: 7740,
            udp_rzv_port: 7741,
            tcp_connect_wait: Duration::from_secs(30),
            udp_connect_wait: Duration::from_secs(30),
            rpc_wait: Duration::from_secs(30),
            tcp_p2p_attempt_timeout: Duration::from_secs(5),
            udp_p2p_attempt_timeout: Duration::from_secs(5),
            udp_grace_period: Duration::from_secs(4),
            endpoint_info_initial_interval: Duration::from_secs(1),
            endpoint_info_max_interval: Duration::from_secs(8),
            hole_punch_interval: Duration::from_secs(1),
            hole_punch_attempts: 4,
            max_accepted_connections: 10,
            listener_backlog: 16,
            max_control_frame_len: 256,
        }
    }
}

/// Socket buffer sizes requested by the application. Values outside of
///  [SocketOptions::VALID_BUFFER_SIZES] are ignored rather than rejected.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SocketOptions {
    pub receive_buffer_size: Option<u32>,
    pub send_buffer_size: Option<u32>,
}
impl SocketOptions {
    pub const VALID_BUFFER_SIZES: std::ops::RangeInclusive<u32> = 8196..=1073741824;

    pub fn effective_receive_buffer_size(&self) -> Option<u32> {
        self.receive_buffer_size
            .filter(|s| Self::VALID_BUFFER_SIZES.contains(s))
    }

    pub fn effective_send_buffer_size(&self) -> Option<u32> {
        self.send_buffer_size
            .filter(|s| Self::VALID_BUFFER_SIZES.contains(s))
    }
}
