use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::config::EndpointConfig;
use crate::controller::request::{Attachment, PendingRequest, RequestParams, RequestTable, ResponseContext};
use crate::error::{RequestError, RequestTarget};
use crate::messaging::session::{RemoteService, SessionChannel};
use crate::messaging::session_messages::{ModuleId, RequestId, SessionMessage};
use crate::runtime::{ScheduledTask, TaskRunner};

/// The encoded result of a remote procedure call. Encoding of arguments and results is up to
///  the application.
pub type RpcResult = Result<Bytes, RequestError>;

type RpcHandler = Box<dyn FnOnce(ResponseContext, RpcResult) + Send>;

struct PendingCall {
    service: Arc<dyn RemoteService>,
    attachment: Option<Attachment>,
    procedure: String,
    handler: RpcHandler,
    timeout: Arc<ScheduledTask>,
}

impl PendingRequest for PendingCall {
    fn service_id(&self) -> i64 {
        self.service.service_id()
    }

    fn timeout(&self) -> &ScheduledTask {
        &self.timeout
    }
}

/// Tracks remote procedure calls. Calls are relayed by the rendezvous server, so there is no
///  connection attempt involved: a call completes with the first result or error the server sends.
#[derive(Clone)]
pub struct RpcController {
    inner: Arc<Inner>,
}

struct Inner {
    default_wait: Duration,
    runner: TaskRunner,
    requests: Mutex<RequestTable<PendingCall>>,
}

impl RpcController {
    pub fn new(default_wait: Duration, runner: TaskRunner) -> RpcController {
        RpcController {
            inner: Arc::new(Inner {
                default_wait,
                runner,
                requests: Mutex::new(RequestTable::new()),
            }),
        }
    }

    pub fn call(&self, service: Arc<dyn RemoteService>, procedure: &str, args: Bytes, params: RequestParams, handler: impl FnOnce(ResponseContext, RpcResult) + Send + 'static) {
        let precondition = params.validate()
            .and_then(|_| if procedure.is_empty() { Err(RequestError::InvalidArgument("procedure name must not be empty".to_string())) } else { Ok(()) })
            .and_then(|_| if service.is_online() { Ok(()) } else { Err(RequestError::ServiceOffline) });
        if let Err(e) = precondition {
            debug!(procedure, "rejecting call: {}", e);
            handler(ResponseContext { service, attachment: params.attachment }, Err(e));
            return;
        }

        let mut requests = self.inner.requests.lock();
        let Some(session) = requests.online_session() else {
            drop(requests);
            debug!(procedure, "rejecting call: session is not online");
            handler(ResponseContext { service, attachment: params.attachment }, Err(RequestError::ClientOffline));
            return;
        };

        let request_id = requests.new_request_id();
        let service_id = service.service_id();
        let wait = EndpointConfig::effective_wait(self.inner.default_wait, params.wait_seconds);
        let timeout = self.inner.schedule_timeout(request_id, wait);

        requests.insert(request_id, PendingCall {
            service,
            attachment: params.attachment,
            procedure: procedure.to_string(),
            handler: Box::new(handler),
            timeout,
        });

        debug!(?request_id, service_id, procedure, "calling remote procedure");
        let message = SessionMessage::RpcRequest {
            request_id,
            service_id,
            procedure: procedure.to_string(),
            args,
            session_tag: params.session_tag,
        };
        if let Err(e) = session.send(message.encode(ModuleId::ClientRpc)) {
            debug!(?request_id, "error sending call: {}", e);
            if let Some(pending) = requests.remove(&request_id) {
                self.inner.deliver(pending, Err(RequestError::ClientOffline));
            }
        }
    }

    pub fn on_message(&self, message: SessionMessage) -> anyhow::Result<()> {
        let (request_id, outcome) = match message {
            SessionMessage::RpcResult { request_id, result } => (request_id, Ok(result)),
            SessionMessage::AppError { request_id, code, payload } => (request_id, Err(RequestError::Application { code, payload })),
            SessionMessage::SoftnetError { request_id, code } | SessionMessage::RequestError { request_id, code } => {
                let mut requests = self.inner.requests.lock();
                let Some(pending) = requests.get_mut(&request_id) else {
                    trace!(?request_id, "error for a call that is gone");
                    return Ok(());
                };
                let error = RequestError::from_code(code, RequestTarget::Procedure(&pending.procedure));
                drop(requests);
                (request_id, Err(error))
            }
            other => bail!("unexpected message for RPC: {:?}", other),
        };

        let mut requests = self.inner.requests.lock();
        if let Some(pending) = requests.remove_for_response(&request_id) {
            self.inner.deliver(pending, outcome);
        }
        Ok(())
    }

    pub fn on_session_connected(&self, session: Arc<dyn SessionChannel>) {
        self.inner.requests.lock().on_session_connected(session);
    }

    pub fn on_session_online(&self) {
        self.inner.requests.lock().on_session_online();
    }

    pub fn on_session_disconnected(&self) {
        let mut requests = self.inner.requests.lock();
        for pending in requests.on_session_closed() {
            self.inner.deliver(pending, Err(RequestError::ClientOffline));
        }
    }

    pub fn on_endpoint_closed(&self) {
        self.inner.requests.lock().on_session_closed();
    }

    pub fn on_remote_service_offline(&self, service_id: i64) {
        let mut requests = self.inner.requests.lock();
        for (_, pending) in requests.remove_for_service(service_id) {
            self.inner.deliver(pending, Err(RequestError::ServiceOffline));
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.requests.lock().len()
    }
}

impl Inner {
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
            info!(?request_id, procedure = %pending.procedure, "call timed out");
            self.deliver(pending, Err(RequestError::TimeoutExpired));
        }
    }

    fn deliver(&self, pending: PendingCall, outcome: RpcResult) {
        let context = ResponseContext {
            service: pending.service,
            attachment: pending.attachment,
        };
        let handler = pending.handler;
        self.runner.execute(move || handler(context, outcome));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::Instant;
    use crate::messaging::session::MockSessionChannel;
    use crate::test_util::session::{TestService, TrackingSessionChannel};

    const SERVICE_ID: i64 = 12;

    fn online_controller() -> (RpcController, Arc<TrackingSessionChannel>) {
        let controller = RpcController::new(Duration::from_secs(30), TaskRunner::current().unwrap());
        let session = TrackingSessionChannel::new();
        controller.on_session_connected(session.clone());
        controller.on_session_online();
        (controller, session)
    }

    fn call(controller: &RpcController, session: &TrackingSessionChannel, service: Arc<TestService>, params: RequestParams) -> (RequestId, UnboundedReceiver<RpcResult>) {
        let (send, recv) = mpsc::unbounded_channel();
        controller.call(service, "sum", Bytes::from_static(&[1, 2]), params, move |_, result| {
            let _ = send.send(result);
        });

        match session.assert_single_message() {
            (ModuleId::ClientRpc, SessionMessage::RpcRequest { request_id, service_id, procedure, args, session_tag }) => {
                assert_eq!(service_id, SERVICE_ID);
                assert_eq!(procedure, "sum");
                assert_eq!(args, Bytes::from_static(&[1, 2]));
                assert_eq!(session_tag, None);
                (request_id, recv)
            }
            other => panic!("expected call, was {:?}", other),
        }
    }

    #[rstest]
    #[case::result(|id| SessionMessage::RpcResult { request_id: id, result: Bytes::from_static(b"3") }, Ok(Bytes::from_static(b"3")))]
    #[case::app_error(|id| SessionMessage::AppError { request_id: id, code: 9, payload: Bytes::from_static(b"boom") }, Err(RequestError::Application { code: 9, payload: Bytes::from_static(b"boom") }))]
    #[case::missing_procedure(|id| SessionMessage::SoftnetError { request_id: id, code: 132 }, Err(RequestError::MissingProcedure("sum".to_string())))]
    #[case::access_denied(|id| SessionMessage::RequestError { request_id: id, code: 112 }, Err(RequestError::AccessDenied))]
    #[case::service_offline(|id| SessionMessage::RequestError { request_id: id, code: 115 }, Err(RequestError::ServiceOffline))]
    #[tokio::test]
    async fn test_response(#[case] response: fn(RequestId) -> SessionMessage, #[case] expected: RpcResult) {
        let (controller, session) = online_controller();
        let (request_id, mut results) = call(&controller, &session, TestService::new(SERVICE_ID), RequestParams::default());

        controller.on_message(response(request_id)).unwrap();
        assert_eq!(results.recv().await.unwrap(), expected);
        assert_eq!(controller.pending_requests(), 0);

        // a second response is ignored
        controller.on_message(response(request_id)).unwrap();
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_offline_service_fails_synchronously_without_timer() {
        let controller = RpcController::new(Duration::from_secs(30), TaskRunner::current().unwrap());
        let mut session = MockSessionChannel::new();
        session.expect_send().never();
        controller.on_session_connected(Arc::new(session));
        controller.on_session_online();

        let service = TestService::new(SERVICE_ID);
        service.set_online(false);
        let result = Arc::new(Mutex::new(None));
        let captured = result.clone();
        controller.call(service, "sum", Bytes::new(), RequestParams::default(), move |_, r| {
            *captured.lock() = Some(r);
        });

        assert_eq!(result.lock().take(), Some(Err(RequestError::ServiceOffline)));
        assert_eq!(controller.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_empty_procedure_is_rejected() {
        let (controller, session) = online_controller();
        let result = Arc::new(Mutex::new(None));
        let captured = result.clone();
        controller.call(TestService::new(SERVICE_ID), "", Bytes::new(), RequestParams::default(), move |_, r| {
            *captured.lock() = Some(r);
        });

        assert!(matches!(result.lock().take(), Some(Err(RequestError::InvalidArgument(_)))));
        session.assert_no_remaining_messages();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_floor() {
        let (controller, session) = online_controller();
        let start = Instant::now();
        let (request_id, mut results) = call(&controller, &session, TestService::new(SERVICE_ID), RequestParams { wait_seconds: 2, ..Default::default() });

        assert_eq!(results.recv().await.unwrap(), Err(RequestError::TimeoutExpired));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5010), "{:?}", elapsed);

        // a late result is ignored
        controller.on_message(SessionMessage::RpcResult { request_id, result: Bytes::new() }).unwrap();
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_session_disconnect() {
        let (controller, session) = online_controller();
        let (_, mut results) = call(&controller, &session, TestService::new(SERVICE_ID), RequestParams::default());

        controller.on_session_disconnected();
        assert_eq!(results.recv().await.unwrap(), Err(RequestError::ClientOffline));

        let (send, mut recv) = mpsc::unbounded_channel();
        controller.call(TestService::new(SERVICE_ID), "sum", Bytes::new(), RequestParams::default(), move |_, r| { let _ = send.send(r); });
        assert_eq!(recv.recv().await.unwrap(), Err(RequestError::ClientOffline));
    }

    #[tokio::test]
    async fn test_remote_service_offline() {
        let (controller, session) = online_controller();
        let (_, mut results) = call(&controller, &session, TestService::new(SERVICE_ID), RequestParams::default());

        controller.on_remote_service_offline(SERVICE_ID + 1);
        assert_eq!(controller.pending_requests(), 1);
        controller.on_remote_service_offline(SERVICE_ID);
        assert_eq!(results.recv().await.unwrap(), Err(RequestError::ServiceOffline));
    }

    #[tokio::test]
    async fn test_unexpected_message() {
        let (controller, _session) = online_controller();
        assert!(controller.on_message(SessionMessage::ConnectionAccepted { request_id: RequestId::new_v4() }).is_err());
    }
}
