//! Public façade.
//!
//! All protocol state lives in a [`Session`] owned by one delivery thread.
//! Transport callbacks and caller requests are pushed onto the same channel
//! and processed there in arrival order, so the session needs no locks.

use crate::config::ClientConfig;
use crate::connection::ConnectionStatus;
use crate::error::ClientError;
use crate::events::{self, ClientEvent, EventHub, ExecutionContext};
use crate::model::{Call, User};
use crate::protocol::{CallSetProperty, Command};
use crate::session::{PeerInfo, Session, SessionOptions};
use crate::transport::{Ack, InboundSink, Transport, TransportError, TransportEvent};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

type Job = Box<dyn FnOnce(&mut Session) + Send + 'static>;

enum Input {
    Transport(TransportEvent),
    Run(Job),
    Shutdown,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    tx: mpsc::UnboundedSender<Input>,
    events: EventHub,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.tx.send(Input::Shutdown);
    }
}

pub struct ClientBuilder {
    options: SessionOptions,
    event_buffer: usize,
    context: Option<Arc<dyn ExecutionContext>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl ClientBuilder {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            options: SessionOptions::from_config(config),
            event_buffer: config.event_buffer,
            context: None,
        }
    }

    /// Overrides where event handlers run. Defaults to the runtime the client
    /// is built on, or inline delivery outside a runtime.
    pub fn execution_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn protocol_version(mut self, version: Option<u32>) -> Self {
        self.options.protocol_version = version;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn build(self, transport: Arc<dyn Transport>) -> Result<Client, ClientError> {
        let context = self.context.unwrap_or_else(events::capture_current);
        let hub = EventHub::new(context, self.event_buffer);
        let (tx, mut rx) = mpsc::unbounded_channel::<Input>();

        let inbound_tx = tx.clone();
        transport.register_inbound(InboundSink::new(move |event| {
            inbound_tx.send(Input::Transport(event)).is_ok()
        }))?;

        let id = Uuid::new_v4();
        let mut session = Session::new(transport, hub.clone(), self.options);
        let thread = std::thread::Builder::new()
            .name("desktop-api-delivery".to_string())
            .spawn(move || {
                tracing::debug!(client = %id, "delivery loop started");
                while let Some(input) = rx.blocking_recv() {
                    match input {
                        Input::Transport(event) => session.handle_transport_event(event),
                        Input::Run(job) => job(&mut session),
                        Input::Shutdown => break,
                    }
                }
                tracing::debug!(client = %id, "delivery loop stopped");
            })
            .map_err(|err| TransportError::Os(err.to_string()))?;

        Ok(Client {
            inner: Arc::new(Inner {
                id,
                tx,
                events: hub,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }
}

impl Client {
    pub fn builder(config: &ClientConfig) -> ClientBuilder {
        ClientBuilder::from_config(config)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Runs `f` against the session on the delivery thread.
    async fn request<R, F>(&self, f: F) -> Result<R, ClientError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Session) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |session| {
            let _ = reply_tx.send(f(session));
        });
        self.inner
            .tx
            .send(Input::Run(job))
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.map_err(|_| ClientError::Closed)
    }

    /// Discovers and attaches to the peer.
    ///
    /// Resolves once the peer answers with a terminal attach status. There is
    /// no built-in deadline; wrap the call in `tokio::time::timeout` if needed.
    /// Once a timed-out attempt is dropped, calling `connect` again discovers
    /// afresh.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let outcome = self.request(|session| session.connect()).await??;
        outcome.await.map_err(|_| ClientError::Closed)??;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(|session| session.disconnect()).await
    }

    pub async fn send(&self, command: Command) -> Result<Ack, ClientError> {
        self.request(move |session| session.send(&command)).await?
    }

    pub async fn send_raw(&self, text: impl Into<String>) -> Result<Ack, ClientError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ClientError::InvalidCommand("empty command".to_string()));
        }
        self.request(move |session| session.send_text(&text)).await?
    }

    pub async fn initiate_call(&self, targets: Vec<String>) -> Result<(), ClientError> {
        self.request(move |session| session.initiate_call(targets))
            .await?
    }

    pub async fn set_call_property(
        &self,
        call_id: impl Into<String>,
        property: CallSetProperty,
        value: Option<String>,
    ) -> Result<Ack, ClientError> {
        let call_id = call_id.into();
        self.request(move |session| {
            session.set_call_property(&call_id, property, value.as_deref())
        })
        .await?
    }

    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.add_handler(Arc::new(handler));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub async fn status(&self) -> Result<ConnectionStatus, ClientError> {
        self.request(|session| session.status()).await
    }

    pub async fn call(&self, id: impl Into<String>) -> Result<Option<Call>, ClientError> {
        let id = id.into();
        self.request(move |session| session.registry().call(&id).cloned())
            .await
    }

    pub async fn calls(&self) -> Result<Vec<Call>, ClientError> {
        self.request(|session| session.registry().calls().cloned().collect())
            .await
    }

    pub async fn user(&self, handle: impl Into<String>) -> Result<Option<User>, ClientError> {
        let handle = handle.into();
        self.request(move |session| session.registry().user(&handle).cloned())
            .await
    }

    pub async fn current_user(&self) -> Result<Option<User>, ClientError> {
        self.request(|session| session.registry().current_user().cloned())
            .await
    }

    pub async fn pending_call(&self) -> Result<Option<Call>, ClientError> {
        self.request(|session| session.registry().pending_call().cloned())
            .await
    }

    pub async fn peer_info(&self) -> Result<PeerInfo, ClientError> {
        self.request(|session| session.peer_info().clone()).await
    }

    /// Says goodbye to the peer and stops the delivery thread.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.disconnect().await?;
        let _ = self.inner.tx.send(Input::Shutdown);
        let thread = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|_| ClientError::Closed)?
                .map_err(|_| ClientError::Closed)?;
        }
        tracing::info!(client = %self.inner.id, "client shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ATTACH_PENDING_AUTHORIZATION, ATTACH_REFUSED, ATTACH_SUCCESS};
    use crate::error::PeerRefusal;
    use crate::events::InlineContext;
    use crate::transport::{MemoryTransport, PeerHandle};
    use std::time::Duration;

    const PEER: PeerHandle = PeerHandle(0x1f00);

    fn test_config() -> ClientConfig {
        ClientConfig {
            negotiate_protocol: false,
            ..ClientConfig::default()
        }
    }

    fn spawn_client() -> (Client, MemoryTransport) {
        let transport = MemoryTransport::new();
        let client = Client::builder(&test_config())
            .build(Arc::new(transport.clone()))
            .unwrap();
        (client, transport)
    }

    async fn answer_discovery(transport: &MemoryTransport, statuses: &[u32]) {
        answer_nth_discovery(transport, 1, statuses).await
    }

    async fn answer_nth_discovery(transport: &MemoryTransport, nth: usize, statuses: &[u32]) {
        while transport.discover_count() < nth {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for status in statuses {
            transport.attach(*status, PEER);
        }
    }

    async fn connected_client() -> (Client, MemoryTransport) {
        let (client, transport) = spawn_client();
        let (result, _) = tokio::join!(
            client.connect(),
            answer_discovery(&transport, &[ATTACH_SUCCESS])
        );
        result.unwrap();
        (client, transport)
    }

    async fn next_event<F>(rx: &mut broadcast::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn connect_waits_through_pending_authorization() {
        let (client, transport) = spawn_client();
        let (result, _) = tokio::join!(
            client.connect(),
            answer_discovery(&transport, &[ATTACH_PENDING_AUTHORIZATION, ATTACH_SUCCESS])
        );
        result.unwrap();
        assert_eq!(client.status().await.unwrap(), ConnectionStatus::Attached);
    }

    #[tokio::test]
    async fn connect_reports_refusal() {
        let (client, transport) = spawn_client();
        let (result, _) = tokio::join!(
            client.connect(),
            answer_discovery(&transport, &[ATTACH_REFUSED])
        );
        assert_eq!(
            result,
            Err(ClientError::Refused(PeerRefusal {
                status: ConnectionStatus::Refused
            }))
        );
    }

    #[tokio::test]
    async fn second_connect_in_flight_is_rejected() {
        let (client, transport) = spawn_client();
        let first = client.clone();
        let pending = tokio::spawn(async move { first.connect().await });
        while transport.discover_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(matches!(client.connect().await, Err(ClientError::State(_))));
        transport.attach(ATTACH_SUCCESS, PEER);
        pending.await.unwrap().unwrap();
        assert_eq!(transport.discover_count(), 1);
    }

    #[tokio::test]
    async fn connect_after_timeout_discovers_again() {
        let (client, transport) = spawn_client();
        let timed_out = tokio::time::timeout(Duration::from_millis(50), client.connect()).await;
        assert!(timed_out.is_err());
        assert_eq!(transport.discover_count(), 1);
        assert_eq!(client.status().await.unwrap(), ConnectionStatus::Discovering);

        let (result, _) = tokio::join!(
            client.connect(),
            answer_nth_discovery(&transport, 2, &[ATTACH_SUCCESS])
        );
        result.unwrap();
        assert_eq!(transport.discover_count(), 2);
        assert_eq!(client.status().await.unwrap(), ConnectionStatus::Attached);
    }

    #[tokio::test]
    async fn placed_call_is_reconciled() {
        let (client, transport) = connected_client().await;
        let mut rx = client.subscribe();

        client.initiate_call(vec!["echo123".to_string()]).await.unwrap();
        assert!(client.pending_call().await.unwrap().is_some());
        assert_eq!(transport.sent_commands(), vec!["CALL echo123".to_string()]);

        transport.deliver(PEER, "CALL 42 STATUS UNPLACED");
        let event = next_event(&mut rx, |e| matches!(e, ClientEvent::CallReceived { .. })).await;
        let ClientEvent::CallReceived { call } = event else {
            unreachable!()
        };
        assert_eq!(call.id.as_deref(), Some("42"));
        assert_eq!(call.targets, vec!["echo123".to_string()]);

        let stored = client.call("42").await.unwrap().unwrap();
        assert_eq!(stored.status.as_deref(), Some("UNPLACED"));
        assert!(client.pending_call().await.unwrap().is_none());
        assert_eq!(client.calls().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handlers_run_on_runtime_in_order() {
        let (client, transport) = connected_client().await;
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        client.on_event(move |event| {
            if let ClientEvent::MessageReceived { payload } = event {
                let _ = seen_tx.send(payload.clone());
            }
        });

        transport.deliver(PEER, "USER alice ONLINESTATUS ONLINE");
        transport.deliver(PEER, "USER bob ONLINESTATUS AWAY");
        assert_eq!(
            seen_rx.recv().await.as_deref(),
            Some("USER alice ONLINESTATUS ONLINE")
        );
        assert_eq!(seen_rx.recv().await.as_deref(), Some("USER bob ONLINESTATUS AWAY"));
        assert_eq!(
            client
                .user("bob")
                .await
                .unwrap()
                .and_then(|u| u.online_status),
            Some("AWAY".to_string())
        );
    }

    #[tokio::test]
    async fn raw_and_typed_sends_reach_transport() {
        let (client, transport) = connected_client().await;
        assert!(matches!(
            client.send_raw("   ").await,
            Err(ClientError::InvalidCommand(_))
        ));
        client.send_raw("GET SKYPEVERSION").await.unwrap();
        client.send(Command::ping()).await.unwrap();
        client
            .set_call_property("42", CallSetProperty::Status, Some("FINISHED".to_string()))
            .await
            .unwrap();
        assert_eq!(
            transport.sent_commands(),
            vec![
                "GET SKYPEVERSION".to_string(),
                "PING".to_string(),
                "SET CALL 42 STATUS FINISHED".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn peer_info_follows_notifications() {
        let (client, transport) = connected_client().await;
        transport.deliver(PEER, "SKYPEVERSION 7.40.0.103");
        transport.deliver(PEER, "CURRENTUSERHANDLE echo123");
        let info = client.peer_info().await.unwrap();
        assert_eq!(info.version.as_deref(), Some("7.40.0.103"));
        assert_eq!(info.current_user.as_deref(), Some("echo123"));
        assert_eq!(
            client.current_user().await.unwrap().map(|u| u.handle),
            Some("echo123".to_string())
        );
    }

    #[tokio::test]
    async fn shutdown_closes_client() {
        let (client, transport) = connected_client().await;
        client.shutdown().await.unwrap();
        assert_eq!(transport.sent_frames().last().map(|(_, f)| f.clone()), Some(vec![0u8]));
        assert_eq!(client.status().await, Err(ClientError::Closed));
        assert!(!transport.deliver(PEER, "CALL 1 STATUS RINGING"));
    }

    #[test]
    fn inline_context_outside_runtime() {
        let transport = MemoryTransport::new();
        let client = Client::builder(&test_config())
            .execution_context(Arc::new(InlineContext))
            .build(Arc::new(transport.clone()))
            .unwrap();
        let delivered_on = Arc::new(Mutex::new(None));
        let slot = delivered_on.clone();
        client.on_event(move |_| {
            *slot.lock().unwrap() = std::thread::current().name().map(str::to_string);
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (result, _) = tokio::join!(
                client.connect(),
                answer_discovery(&transport, &[ATTACH_SUCCESS])
            );
            result.unwrap();
        });
        assert_eq!(
            delivered_on.lock().unwrap().as_deref(),
            Some("desktop-api-delivery")
        );
    }
}
