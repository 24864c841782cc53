//! Serial protocol core.
//!
//! A [`Session`] owns the connection state machine, the entity registry and
//! the peer info. It is driven from exactly one thread: the client's delivery
//! loop feeds it transport events and caller requests in arrival order.

use crate::config::ClientConfig;
use crate::connection::{ConnectOutcome, Connection, ConnectionStatus, StatusTransition};
use crate::error::{ClientError, ConnectionStateError};
use crate::events::{ClientEvent, EventHub};
use crate::protocol::{self, Action, CallSetProperty, Command, DecodeError, PropertyUpdate};
use crate::registry::EntityRegistry;
use crate::transport::{self, Ack, PeerHandle, Transport, TransportEvent};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub version: Option<String>,
    pub connection_status: Option<String>,
    pub protocol: Option<u32>,
    pub current_user: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Sent as `PROTOCOL <n>` right after a successful attach.
    pub protocol_version: Option<u32>,
}

impl SessionOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            protocol_version: config
                .negotiate_protocol
                .then_some(config.protocol_version),
        }
    }
}

pub struct Session {
    transport: Arc<dyn Transport>,
    connection: Connection,
    registry: EntityRegistry,
    peer: PeerInfo,
    events: EventHub,
    options: SessionOptions,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, events: EventHub, options: SessionOptions) -> Self {
        Self {
            transport,
            connection: Connection::new(),
            registry: EntityRegistry::new(),
            peer: PeerInfo::default(),
            events,
            options,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Broadcasts discovery; the receiver settles once the peer answers.
    pub fn connect(&mut self) -> Result<oneshot::Receiver<ConnectOutcome>, ClientError> {
        let (outcome, transition) = self.connection.begin_connect()?;
        self.emit_transition(transition);

        if let Err(err) = self.transport.broadcast_discover() {
            tracing::warn!(error = %err, "discovery broadcast failed");
            let transition = self.connection.abort_connect();
            self.emit_transition(transition);
            return Err(err.into());
        }
        tracing::debug!("discovery broadcast sent");
        Ok(outcome)
    }

    pub fn disconnect(&mut self) {
        if let Some(call) = self.registry.discard_pending_call() {
            tracing::debug!(targets = ?call.targets, "discarding unreconciled pending call");
        }
        let (peer, transition) = self.connection.detach();
        let Some(peer) = peer else {
            return;
        };
        if let Err(err) = self.transport.send(peer, &transport::encode_frame("")) {
            tracing::warn!(peer = %peer, error = %err, "goodbye send failed");
        }
        self.emit_transition(transition);
    }

    pub fn send_text(&mut self, text: &str) -> Result<Ack, ClientError> {
        let peer = self.attached_peer()?;
        self.connection.record_sent(text);
        tracing::debug!(payload = %text, "->");
        let ack = self.transport.send(peer, &transport::encode_frame(text))?;
        Ok(ack)
    }

    pub fn send(&mut self, command: &Command) -> Result<Ack, ClientError> {
        self.send_text(&command.to_string())
    }

    pub fn initiate_call(&mut self, targets: Vec<String>) -> Result<(), ClientError> {
        let targets: Vec<String> = targets.iter().map(|t| t.trim().to_string()).collect();
        if targets.is_empty() || targets.iter().any(String::is_empty) {
            return Err(ClientError::InvalidCommand(
                "a call needs at least one non-blank target".to_string(),
            ));
        }
        self.attached_peer()?;
        self.registry.place_pending_call(targets.clone())?;

        if let Err(err) = self.send(&Command::call(targets)) {
            self.registry.discard_pending_call();
            return Err(err);
        }
        Ok(())
    }

    pub fn set_call_property(
        &mut self,
        call_id: &str,
        property: CallSetProperty,
        value: Option<&str>,
    ) -> Result<Ack, ClientError> {
        let command = Command::set_call_property(call_id, property, value)
            .map_err(ClientError::InvalidCommand)?;
        self.send(&command)
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Attach { status, peer } => self.handle_attach(status, peer),
            TransportEvent::Payload { from, frame } => self.handle_payload(from, &frame),
        }
    }

    fn attached_peer(&self) -> Result<PeerHandle, ConnectionStateError> {
        self.connection
            .peer()
            .filter(|_| self.connection.is_attached())
            .ok_or(ConnectionStateError::NotAttached)
    }

    fn handle_attach(&mut self, status: u32, peer: PeerHandle) {
        tracing::debug!(status, peer = %peer, "attach reply");
        let transition = self.connection.apply_attach(status, peer);
        let attached_now = transition.is_some_and(|t| t.to == ConnectionStatus::Attached);
        self.emit_transition(transition);

        if !attached_now {
            return;
        }
        if let Some(version) = self.options.protocol_version {
            match self.send(&Command::protocol(version)) {
                // The peer answers an accepted version with the same text, which
                // echo suppression swallows; a downgrade arrives as a new reply.
                Ok(_) => self.peer.protocol = Some(version),
                Err(err) => tracing::warn!(error = %err, "protocol negotiation send failed"),
            }
        }
    }

    fn handle_payload(&mut self, from: PeerHandle, frame: &[u8]) {
        if !self.connection.accepts_from(from) {
            tracing::debug!(sender = %from, "payload from unattached sender ignored");
            return;
        }
        let text = match transport::decode_frame(frame) {
            Ok(text) => text,
            Err(err) => {
                log_decode_error(Some(&DecodeError::from(err)));
                return;
            }
        };
        tracing::debug!(payload = %text, "<-");
        if self.connection.is_echo(&text) {
            tracing::debug!("echo of last sent payload ignored");
            return;
        }

        let update = protocol::tokenize(&text);
        if matches!(update, Err(DecodeError::TooFewTokens)) {
            tracing::debug!(payload = %text, "payload discarded; too few tokens");
            return;
        }
        self.events.emit(ClientEvent::MessageReceived {
            payload: text.clone(),
        });
        match update {
            Ok(update) => self.dispatch(update),
            Err(err) => tracing::debug!(error = %err, "unrecognized notification dropped"),
        }
    }

    fn dispatch(&mut self, update: PropertyUpdate<'_>) {
        match update.action {
            Action::Call => self.dispatch_call(update),
            Action::User => {
                let change = self.registry.apply_user_update(
                    update.subject,
                    update.property,
                    update.value,
                );
                log_decode_error(change.decode_error.as_ref());
                self.events.emit(ClientEvent::UserUpdated { user: change.user });
            }
            Action::SkypeVersion => {
                self.peer.version = Some(update.subject.to_string());
            }
            Action::ConnStatus => {
                self.peer.connection_status = Some(update.subject.to_string());
            }
            Action::Protocol => match update.subject.parse::<u32>() {
                Ok(version) => self.peer.protocol = Some(version),
                Err(err) => log_decode_error(Some(&DecodeError::InvalidValue {
                    property: "PROTOCOL".to_string(),
                    value: update.subject.to_string(),
                    reason: err.to_string(),
                })),
            },
            Action::CurrentUserHandle => {
                self.peer.current_user = Some(update.subject.to_string());
                if let Some(user) = self.registry.set_current_user(update.subject) {
                    self.events.emit(ClientEvent::CurrentUserChanged { user });
                }
            }
            Action::UserStatus => match self.registry.set_current_user_status(update.subject) {
                Some(user) => self.events.emit(ClientEvent::UserUpdated { user }),
                None => tracing::debug!("user status before current user is known"),
            },
            Action::Error => match protocol::parse_peer_error(&update) {
                Ok((code, message)) => {
                    tracing::warn!(code, message = %message, "peer reported an error");
                    self.events.emit(ClientEvent::PeerError { code, message });
                }
                Err(err) => log_decode_error(Some(&err)),
            },
            Action::Chat | Action::Group | Action::ChatMember | Action::WindowState => {
                tracing::debug!(action = %update.action, subject = update.subject, "ignored notification");
            }
        }
    }

    fn dispatch_call(&mut self, update: PropertyUpdate<'_>) {
        let change = self
            .registry
            .apply_call_update(update.subject, update.property, update.value);
        log_decode_error(change.decode_error.as_ref());
        if change.adopted {
            tracing::info!(call = update.subject, targets = ?change.call.targets, "placed call identified");
        }

        for fetch in &change.fetches {
            let command = Command::get_call_property(update.subject, fetch.property)
                .arg(fetch.argument.clone());
            if let Err(err) = self.send(&command) {
                tracing::warn!(command = %command, error = %err, "dependent fetch failed");
            }
        }

        let event = if change.created {
            ClientEvent::CallReceived { call: change.call }
        } else {
            ClientEvent::CallUpdated { call: change.call }
        };
        self.events.emit(event);
    }

    fn emit_transition(&self, transition: Option<StatusTransition>) {
        if let Some(StatusTransition { from, to }) = transition {
            self.events.emit(ClientEvent::StatusChanging { from, to });
            self.events.emit(ClientEvent::StatusChanged { status: to });
        }
    }
}

fn log_decode_error(err: Option<&DecodeError>) {
    match err {
        None => {}
        Some(err @ DecodeError::UnknownProperty { .. }) => {
            tracing::debug!(error = %err, "update dropped")
        }
        Some(err) => tracing::warn!(error = %err, "update dropped"),
    }
}
