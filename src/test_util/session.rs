use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::connector::{ConnectionMode, ConnectorArgs, ConnectorEvent, ConnectorEvents, ConnectorFactory, ConnectorHandle};
use crate::messaging::session::{RemoteService, SessionChannel};
use crate::messaging::session_messages::{ModuleId, SessionMessage, AUTH_KEY_LEN};

/// Records everything sent through it, decoding messages for inspection
#[derive(Default)]
pub struct TrackingSessionChannel {
    sent: Mutex<Vec<Bytes>>,
    broken: AtomicBool,
}
impl TrackingSessionChannel {
    pub fn new() -> Arc<TrackingSessionChannel> {
        Arc::new(TrackingSessionChannel::default())
    }

    /// Makes all further sends fail
    pub fn break_channel(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Returns and forgets all messages sent so far
    pub fn sent_messages(&self) -> Vec<(ModuleId, SessionMessage)> {
        self.sent.lock()
            .drain(..)
            .map(|raw| SessionMessage::decode(&raw).expect("sent message does not decode"))
            .collect()
    }

    pub fn assert_single_message(&self) -> (ModuleId, SessionMessage) {
        let mut sent = self.sent_messages();
        assert_eq!(sent.len(), 1, "expected a single message, was {:?}", sent);
        sent.remove(0)
    }

    pub fn assert_no_remaining_messages(&self) {
        let sent = self.sent_messages();
        assert!(sent.is_empty(), "unexpected messages: {:?}", sent);
    }
}

impl SessionChannel for TrackingSessionChannel {
    fn send(&self, message: Bytes) -> anyhow::Result<()> {
        if self.broken.load(Ordering::Acquire) {
            anyhow::bail!("session channel is closed");
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

pub struct TestService {
    id: i64,
    online: AtomicBool,
}
impl TestService {
    pub fn new(id: i64) -> Arc<TestService> {
        Arc::new(TestService {
            id,
            online: AtomicBool::new(true),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

impl RemoteService for TestService {
    fn service_id(&self) -> i64 {
        self.id
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// Hands out connectors whose events are scripted by the test
pub struct FakeConnectorFactory<C> {
    started: Mutex<Vec<Arc<FakeConnector<C>>>>,
}
impl<C> Default for FakeConnectorFactory<C> {
    fn default() -> Self {
        FakeConnectorFactory {
            started: Default::default(),
        }
    }
}
impl<C: Send + 'static> FakeConnectorFactory<C> {
    pub fn new() -> Arc<FakeConnectorFactory<C>> {
        Arc::new(FakeConnectorFactory::default())
    }

    pub fn num_started(&self) -> usize {
        self.started.lock().len()
    }

    pub fn connector(&self, index: usize) -> Arc<FakeConnector<C>> {
        self.started.lock()
            .get(index)
            .cloned()
            .expect("no such connector was started")
    }
}

impl<C: Send + 'static> ConnectorFactory<C> for FakeConnectorFactory<C> {
    fn start(&self, args: ConnectorArgs, events: ConnectorEvents<C>) -> Arc<dyn ConnectorHandle> {
        let connector = Arc::new(FakeConnector {
            args,
            events,
            aborted: AtomicBool::new(false),
            auth_hashes: Default::default(),
        });
        self.started.lock().push(connector.clone());
        connector
    }
}

pub struct FakeConnector<C> {
    pub args: ConnectorArgs,
    events: ConnectorEvents<C>,
    aborted: AtomicBool,
    auth_hashes: Mutex<Vec<([u8; AUTH_KEY_LEN], [u8; AUTH_KEY_LEN])>>,
}
impl<C> FakeConnector<C> {
    pub fn established(&self, connection: C, mode: ConnectionMode) {
        let _ = self.events.send(ConnectorEvent::Connected { connection, mode });
    }

    pub fn fail(&self) {
        let _ = self.events.send(ConnectorEvent::Failed(anyhow::anyhow!("scripted failure")));
    }

    pub fn auth_key(&self, key: [u8; AUTH_KEY_LEN]) {
        let _ = self.events.send(ConnectorEvent::AuthKey(key));
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn auth_hashes(&self) -> Vec<([u8; AUTH_KEY_LEN], [u8; AUTH_KEY_LEN])> {
        self.auth_hashes.lock().clone()
    }
}

impl<C: Send + 'static> ConnectorHandle for FakeConnector<C> {
    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    fn on_authentication_hash(&self, hash: [u8; AUTH_KEY_LEN], key: [u8; AUTH_KEY_LEN]) {
        self.auth_hashes.lock().push((hash, key));
    }
}
