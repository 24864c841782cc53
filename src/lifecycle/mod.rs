//! Reconciles locally placed calls with the peer's notifications.
//!
//! A call placed with `CALL <target>` has no id until the peer announces it.
//! The first `CALL <id> STATUS UNPLACED` for an unknown id adopts the pending
//! call; any other first notification creates a fresh call and leaves the
//! pending one waiting.

use crate::error::ConnectionStateError;
use crate::model::Call;
use crate::protocol::DecodeError;
use crate::registry::EntityRegistry;
use crate::schema::{self, DependentFetch};
use std::collections::btree_map::Entry;

const ADOPT_PROPERTY: &str = "STATUS";
const ADOPT_VALUE: &str = "UNPLACED";

#[derive(Debug, Clone)]
pub struct CallChange {
    pub call: Call,
    /// The call was registered by this notification.
    pub created: bool,
    /// Registration adopted the pending call.
    pub adopted: bool,
    pub fetches: Vec<DependentFetch>,
    pub decode_error: Option<DecodeError>,
}

impl EntityRegistry {
    pub fn place_pending_call(&mut self, targets: Vec<String>) -> Result<(), ConnectionStateError> {
        if self.pending_call.is_some() {
            return Err(ConnectionStateError::CallPending);
        }
        self.pending_call = Some(Call::pending(targets));
        Ok(())
    }

    pub fn discard_pending_call(&mut self) -> Option<Call> {
        self.pending_call.take()
    }

    /// `CALL <id> [<property> [<value>]]`.
    pub fn apply_call_update(
        &mut self,
        id: &str,
        property: Option<&str>,
        value: Option<&str>,
    ) -> CallChange {
        let mut created = false;
        let mut adopted = false;

        let call = match self.calls.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let adopt = property == Some(ADOPT_PROPERTY) && value == Some(ADOPT_VALUE);
                let call = match self.pending_call.take() {
                    Some(mut pending) if adopt => {
                        pending.id = Some(id.to_string());
                        adopted = true;
                        pending
                    }
                    other => {
                        self.pending_call = other;
                        Call::with_id(id)
                    }
                };
                created = true;
                entry.insert(call)
            }
        };

        let mut fetches = Vec::new();
        let mut decode_error = None;
        if let Some(property) = property {
            match schema::update(call, property, value) {
                Ok(requested) => fetches = requested,
                Err(err) => decode_error = Some(err),
            }
        }

        CallChange {
            call: call.clone(),
            created,
            adopted,
            fetches,
            decode_error,
        }
    }
}
