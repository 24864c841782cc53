//! Single owner of every live entity.
//!
//! The registry lives on the delivery thread. Everything outside it works
//! with ids and cloned snapshots.

use crate::model::{Call, User};
use crate::protocol::DecodeError;
use crate::schema;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct EntityRegistry {
    pub(crate) calls: BTreeMap<String, Call>,
    pub(crate) users: BTreeMap<String, User>,
    pub(crate) pending_call: Option<Call>,
    pub(crate) current_user: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UserChange {
    pub user: User,
    pub created: bool,
    pub decode_error: Option<DecodeError>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call(&self, id: &str) -> Option<&Call> {
        self.calls.get(id)
    }

    pub fn calls(&self) -> impl Iterator<Item = &Call> {
        self.calls.values()
    }

    pub fn user(&self, handle: &str) -> Option<&User> {
        self.users.get(handle)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn current_user(&self) -> Option<&User> {
        self.current_user
            .as_deref()
            .and_then(|handle| self.users.get(handle))
    }

    pub fn pending_call(&self) -> Option<&Call> {
        self.pending_call.as_ref()
    }

    fn user_entry(&mut self, handle: &str) -> (&mut User, bool) {
        let created = !self.users.contains_key(handle);
        let user = self
            .users
            .entry(handle.to_string())
            .or_insert_with(|| User::new(handle));
        (user, created)
    }

    /// `USER <handle> [<property> [<value>]]`.
    pub fn apply_user_update(
        &mut self,
        handle: &str,
        property: Option<&str>,
        value: Option<&str>,
    ) -> UserChange {
        let (user, created) = self.user_entry(handle);
        let decode_error = match property {
            Some(property) => schema::update(user, property, value).err(),
            None => None,
        };
        UserChange {
            user: user.clone(),
            created,
            decode_error,
        }
    }

    /// Marks `handle` as the signed-in user; `None` when it already was.
    pub fn set_current_user(&mut self, handle: &str) -> Option<User> {
        if self.current_user.as_deref() == Some(handle) && self.users.contains_key(handle) {
            return None;
        }
        let (user, _) = self.user_entry(handle);
        let snapshot = user.clone();
        self.current_user = Some(handle.to_string());
        Some(snapshot)
    }

    /// Ignored while no current user is known.
    pub fn set_current_user_status(&mut self, status: &str) -> Option<User> {
        let handle = self.current_user.as_deref()?;
        let user = self.users.get_mut(handle)?;
        user.online_status = Some(status.to_string());
        Some(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_update_creates_then_updates() {
        let mut registry = EntityRegistry::new();
        let change = registry.apply_user_update("echo123", Some("ONLINESTATUS"), Some("ONLINE"));
        assert!(change.created);
        assert!(change.decode_error.is_none());
        assert_eq!(change.user.online_status.as_deref(), Some("ONLINE"));

        let change = registry.apply_user_update("echo123", Some("NEWPROP"), Some("x"));
        assert!(!change.created);
        assert!(change.decode_error.is_some());
        assert_eq!(
            registry.user("echo123").and_then(|u| u.online_status.as_deref()),
            Some("ONLINE")
        );
    }

    #[test]
    fn current_user_tracks_handle_and_status() {
        let mut registry = EntityRegistry::new();
        assert!(registry.set_current_user_status("AWAY").is_none());
        assert!(registry.current_user().is_none());

        assert!(registry.set_current_user("me").is_some());
        assert!(registry.set_current_user("me").is_none());
        let user = registry.set_current_user_status("AWAY").unwrap();
        assert_eq!(user.handle, "me");
        assert_eq!(
            registry.current_user().and_then(|u| u.online_status.as_deref()),
            Some("AWAY")
        );
    }
}
