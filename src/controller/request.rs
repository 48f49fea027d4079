use std::any::Any;
use std::sync::Arc;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::SocketOptions;
use crate::error::RequestError;
use crate::messaging::session::{RemoteService, SessionChannel, SessionStatus};
use crate::messaging::session_messages::{RequestId, MAX_SESSION_TAG_LEN};
use crate::runtime::ScheduledTask;

/// Opaque application data that travels with a request and is handed back with its outcome
pub type Attachment = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub struct RequestParams {
    pub attachment: Option<Attachment>,
    /// 0 for the controller's default wait time
    pub wait_seconds: u32,
    pub session_tag: Option<Bytes>,
    /// applied to the connection attempt's sockets, ignored for RPC calls
    pub socket_options: SocketOptions,
}
impl RequestParams {
    pub fn validate(&self) -> Result<(), RequestError> {
        match &self.session_tag {
            Some(tag) if tag.len() > MAX_SESSION_TAG_LEN => Err(RequestError::InvalidArgument(
                format!("session tag has {} bytes, the maximum is {}", tag.len(), MAX_SESSION_TAG_LEN))),
            _ => Ok(()),
        }
    }
}

/// Passed to a response handler together with the outcome
#[derive(Clone)]
pub struct ResponseContext {
    pub service: Arc<dyn RemoteService>,
    pub attachment: Option<Attachment>,
}

/// The table entry of a request that has been sent to the server and not completed yet
pub(crate) trait PendingRequest {
    fn service_id(&self) -> i64;
    fn timeout(&self) -> &ScheduledTask;
}

/// The in-flight requests of a controller, together with the session they were sent on.
///
/// Every request leaves the table exactly once, and whoever removes it owns its outcome. A
///  response removes its request only after winning the race against the request's timeout, so
///  a timeout that fired concurrently is never overruled.
pub(crate) struct RequestTable<P> {
    status: SessionStatus,
    session: Option<Arc<dyn SessionChannel>>,
    requests: FxHashMap<RequestId, P>,
}

impl<P: PendingRequest> RequestTable<P> {
    pub fn new() -> RequestTable<P> {
        RequestTable {
            status: SessionStatus::Disconnected,
            session: None,
            requests: FxHashMap::default(),
        }
    }

    pub fn on_session_connected(&mut self, session: Arc<dyn SessionChannel>) {
        self.status = SessionStatus::Connected;
        self.session = Some(session);
    }

    pub fn on_session_online(&mut self) {
        if self.session.is_some() {
            self.status = SessionStatus::Online;
        }
        else {
            debug!("session reported online without being connected");
        }
    }

    /// Forgets the session and removes all requests, cancelling their timeouts
    pub fn on_session_closed(&mut self) -> Vec<P> {
        self.status = SessionStatus::Disconnected;
        self.session = None;

        let removed = self.requests.drain()
            .map(|(_, pending)| pending)
            .collect::<Vec<_>>();
        for pending in &removed {
            pending.timeout().cancel();
        }
        removed
    }

    /// Removes and returns all requests targeting the given service
    pub fn remove_for_service(&mut self, service_id: i64) -> Vec<(RequestId, P)> {
        let ids = self.requests.iter()
            .filter(|(_, pending)| pending.service_id() == service_id)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        ids.into_iter()
            .filter_map(|id| self.requests.remove(&id).map(|p| (id, p)))
            .inspect(|(_, pending)| { pending.timeout().cancel(); })
            .collect()
    }

    /// The session to send requests on, if it is online
    pub fn online_session(&self) -> Option<Arc<dyn SessionChannel>> {
        match self.status {
            SessionStatus::Online => self.session.clone(),
            _ => None,
        }
    }

    pub fn session(&self) -> Option<&Arc<dyn SessionChannel>> {
        self.session.as_ref()
    }

    pub fn new_request_id(&self) -> RequestId {
        loop {
            let id = Uuid::new_v4();
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&mut self, request_id: RequestId, pending: P) {
        self.requests.insert(request_id, pending);
    }

    pub fn get_mut(&mut self, request_id: &RequestId) -> Option<&mut P> {
        self.requests.get_mut(request_id)
    }

    /// Removes a request to deliver a response to it. Returns `None` if the request is gone, or if
    ///  its timeout fired concurrently and owns the outcome.
    pub fn remove_for_response(&mut self, request_id: &RequestId) -> Option<P> {
        let Some(pending) = self.requests.get(request_id) else {
            trace!(?request_id, "no pending request - ignoring response");
            return None;
        };
        if !pending.timeout().cancel() {
            debug!(?request_id, "request timed out concurrently - ignoring response");
            return None;
        }
        self.requests.remove(request_id)
    }

    /// Removes a request after its timeout fired
    pub fn remove_for_timeout(&mut self, request_id: &RequestId) -> Option<P> {
        self.requests.remove(request_id)
    }

    /// Removes a request without checking its timeout, e.g. because it could not be sent
    pub fn remove(&mut self, request_id: &RequestId) -> Option<P> {
        let removed = self.requests.remove(request_id);
        if let Some(pending) = &removed {
            pending.timeout().cancel();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
