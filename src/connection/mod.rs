//! Handshake state machine for the attach/discover exchange.

use crate::error::{ConnectionStateError, PeerRefusal};
use crate::transport::PeerHandle;
use serde::Serialize;
use tokio::sync::oneshot;

pub const ATTACH_SUCCESS: u32 = 0;
pub const ATTACH_PENDING_AUTHORIZATION: u32 = 1;
pub const ATTACH_REFUSED: u32 = 2;
pub const ATTACH_NOT_AVAILABLE: u32 = 3;
pub const ATTACH_API_AVAILABLE: u32 = 0x8001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Discovering,
    Attached,
    PendingAuthorization,
    Refused,
    Unavailable,
    /// Unsolicited readiness broadcast from the peer; a fresh attempt may follow.
    Available,
}

impl ConnectionStatus {
    pub fn from_attach_code(code: u32) -> Self {
        match code {
            ATTACH_SUCCESS => Self::Attached,
            ATTACH_PENDING_AUTHORIZATION => Self::PendingAuthorization,
            ATTACH_REFUSED => Self::Refused,
            ATTACH_NOT_AVAILABLE => Self::Unavailable,
            ATTACH_API_AVAILABLE => Self::Available,
            _ => Self::Unknown,
        }
    }

    /// Whether this status ends an in-flight connect attempt.
    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Attached | Self::Refused | Self::Unavailable | Self::Unknown
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

pub type ConnectOutcome = Result<(), PeerRefusal>;

#[derive(Debug, Default)]
pub struct Connection {
    status: ConnectionStatus,
    peer: Option<PeerHandle>,
    last_sent: Option<String>,
    connect_waiter: Option<oneshot::Sender<ConnectOutcome>>,
}

impl Connection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn peer(&self) -> Option<PeerHandle> {
        self.peer
    }

    pub fn is_attached(&self) -> bool {
        self.status == ConnectionStatus::Attached
    }

    /// A waiter whose receiver was dropped (the caller gave up) no longer
    /// counts, so the next attempt replaces it and broadcasts again.
    pub fn connect_in_flight(&self) -> bool {
        self.connect_waiter
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Starts a connect attempt and hands back its one-shot outcome.
    pub fn begin_connect(
        &mut self,
    ) -> Result<(oneshot::Receiver<ConnectOutcome>, Option<StatusTransition>), ConnectionStateError>
    {
        match self.status {
            ConnectionStatus::Attached => return Err(ConnectionStateError::AlreadyAttached),
            ConnectionStatus::Unavailable => return Err(ConnectionStateError::PeerUnavailable),
            _ => {}
        }
        if self.connect_in_flight() {
            return Err(ConnectionStateError::ConnectInProgress);
        }
        let (tx, rx) = oneshot::channel();
        self.connect_waiter = Some(tx);
        Ok((rx, self.set_status(ConnectionStatus::Discovering)))
    }

    /// Undoes [`begin_connect`](Self::begin_connect) after the broadcast failed.
    pub fn abort_connect(&mut self) -> Option<StatusTransition> {
        self.connect_waiter = None;
        self.peer = None;
        self.set_status(ConnectionStatus::Unknown)
    }

    /// Applies an attach reply and settles an in-flight connect on a terminal status.
    pub fn apply_attach(&mut self, code: u32, peer: PeerHandle) -> Option<StatusTransition> {
        let status = ConnectionStatus::from_attach_code(code);
        self.peer = (status == ConnectionStatus::Attached).then_some(peer);
        let transition = self.set_status(status);

        if status.is_terminal() {
            if let Some(waiter) = self.connect_waiter.take() {
                let outcome = match status {
                    ConnectionStatus::Attached => Ok(()),
                    status => Err(PeerRefusal { status }),
                };
                // Receiver may have been dropped by an impatient caller.
                let _ = waiter.send(outcome);
            }
        }
        transition
    }

    /// Returns the peer to say goodbye to, or `None` when not attached.
    pub fn detach(&mut self) -> (Option<PeerHandle>, Option<StatusTransition>) {
        if !self.is_attached() {
            return (None, None);
        }
        let peer = self.peer.take();
        (peer, self.set_status(ConnectionStatus::Unknown))
    }

    pub fn record_sent(&mut self, payload: &str) {
        self.last_sent = Some(payload.to_string());
    }

    pub fn last_sent(&self) -> Option<&str> {
        self.last_sent.as_deref()
    }

    /// True when `inbound` is the peer echoing our last command back.
    pub fn is_echo(&self, inbound: &str) -> bool {
        self.last_sent
            .as_deref()
            .is_some_and(|sent| sent.to_uppercase() == inbound.to_uppercase())
    }

    pub fn accepts_from(&self, sender: PeerHandle) -> bool {
        self.is_attached() && self.peer == Some(sender)
    }

    fn set_status(&mut self, status: ConnectionStatus) -> Option<StatusTransition> {
        if self.status == status {
            return None;
        }
        let from = std::mem::replace(&mut self.status, status);
        tracing::info!(from = ?from, to = ?status, "connection status changed");
        Some(StatusTransition { from, to: status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: PeerHandle = PeerHandle(0x77);

    #[test]
    fn attach_codes_map_to_statuses() {
        assert_eq!(ConnectionStatus::from_attach_code(0), ConnectionStatus::Attached);
        assert_eq!(
            ConnectionStatus::from_attach_code(1),
            ConnectionStatus::PendingAuthorization
        );
        assert_eq!(ConnectionStatus::from_attach_code(2), ConnectionStatus::Refused);
        assert_eq!(ConnectionStatus::from_attach_code(3), ConnectionStatus::Unavailable);
        assert_eq!(
            ConnectionStatus::from_attach_code(0x8001),
            ConnectionStatus::Available
        );
        assert_eq!(ConnectionStatus::from_attach_code(7), ConnectionStatus::Unknown);
    }

    #[test]
    fn connect_resolves_on_attach_and_sets_peer() {
        let mut conn = Connection::new();
        let (mut rx, transition) = conn.begin_connect().unwrap();
        assert_eq!(
            transition,
            Some(StatusTransition {
                from: ConnectionStatus::Unknown,
                to: ConnectionStatus::Discovering
            })
        );

        conn.apply_attach(ATTACH_PENDING_AUTHORIZATION, PEER);
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.peer(), None);

        conn.apply_attach(ATTACH_SUCCESS, PEER);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(conn.peer(), Some(PEER));
        assert!(!conn.connect_in_flight());
    }

    #[test]
    fn refusal_rejects_with_status() {
        let mut conn = Connection::new();
        let (mut rx, _) = conn.begin_connect().unwrap();
        conn.apply_attach(ATTACH_API_AVAILABLE, PEER);
        assert!(rx.try_recv().is_err());
        conn.apply_attach(ATTACH_REFUSED, PEER);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(PeerRefusal {
                status: ConnectionStatus::Refused
            })
        );
        assert_eq!(conn.peer(), None);
    }

    #[test]
    fn connect_rejected_while_attached_unavailable_or_in_flight() {
        let mut conn = Connection::new();
        let _pending = conn.begin_connect().unwrap();
        assert_eq!(
            conn.begin_connect().err(),
            Some(ConnectionStateError::ConnectInProgress)
        );

        conn.apply_attach(ATTACH_SUCCESS, PEER);
        assert_eq!(
            conn.begin_connect().err(),
            Some(ConnectionStateError::AlreadyAttached)
        );

        conn.apply_attach(ATTACH_NOT_AVAILABLE, PEER);
        assert_eq!(
            conn.begin_connect().err(),
            Some(ConnectionStateError::PeerUnavailable)
        );
    }

    #[test]
    fn unchanged_status_yields_no_transition() {
        let mut conn = Connection::new();
        assert!(conn.apply_attach(ATTACH_SUCCESS, PEER).is_some());
        assert!(conn.apply_attach(ATTACH_SUCCESS, PEER).is_none());
    }

    #[test]
    fn abort_resets_to_unknown() {
        let mut conn = Connection::new();
        let (mut rx, _) = conn.begin_connect().unwrap();
        let transition = conn.abort_connect().unwrap();
        assert_eq!(transition.to, ConnectionStatus::Unknown);
        assert!(rx.try_recv().is_err());
        assert!(conn.begin_connect().is_ok());
    }

    #[test]
    fn abandoned_connect_can_be_retried() {
        let mut conn = Connection::new();
        let (rx, _) = conn.begin_connect().unwrap();
        assert!(conn.connect_in_flight());
        drop(rx);
        assert!(!conn.connect_in_flight());

        let (mut rx, transition) = conn.begin_connect().unwrap();
        assert!(transition.is_none());
        assert_eq!(conn.status(), ConnectionStatus::Discovering);
        conn.apply_attach(ATTACH_SUCCESS, PEER);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn detach_only_when_attached() {
        let mut conn = Connection::new();
        assert_eq!(conn.detach(), (None, None));

        conn.apply_attach(ATTACH_SUCCESS, PEER);
        let (peer, transition) = conn.detach();
        assert_eq!(peer, Some(PEER));
        assert_eq!(transition.map(|t| t.to), Some(ConnectionStatus::Unknown));
        assert_eq!(conn.peer(), None);
    }

    #[test]
    fn echo_check_ignores_case_and_sender_filter_requires_attach() {
        let mut conn = Connection::new();
        assert!(!conn.is_echo("GET SKYPEVERSION"));
        conn.record_sent("GET SKYPEVERSION");
        assert!(conn.is_echo("get skypeversion"));
        assert!(!conn.is_echo("SKYPEVERSION 7.0"));

        assert!(!conn.accepts_from(PEER));
        conn.apply_attach(ATTACH_SUCCESS, PEER);
        assert!(conn.accepts_from(PEER));
        assert!(!conn.accepts_from(PeerHandle(1)));
    }
}
