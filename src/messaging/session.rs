use bytes::Bytes;
#[cfg(test)] use mockall::automock;

/// The established, authenticated connection between this endpoint and its rendezvous server.
///  Sending is fire-and-forget: messages are queued for transmission in order.
#[cfg_attr(test, automock)]
pub trait SessionChannel: Send + Sync + 'static {
    fn send(&self, message: Bytes) -> anyhow::Result<()>;
}

/// A remote party that requests can target, as tracked by the session's presence information
pub trait RemoteService: Send + Sync + 'static {
    fn service_id(&self) -> i64;
    fn is_online(&self) -> bool;
}

/// Lifecycle of the session as seen by the request controllers
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    Disconnected,
    /// the session's transport is up, but the server did not confirm the endpoint yet
    Connected,
    Online,
}
