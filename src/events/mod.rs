//! Notification fan-out.
//!
//! Events are produced on the delivery thread. Registered handlers run on the
//! [`ExecutionContext`] captured when the client was built; broadcast
//! subscribers pull from their own receiver.

use crate::connection::ConnectionStatus;
use crate::model::{Call, User};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    StatusChanging {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    StatusChanged {
        status: ConnectionStatus,
    },
    MessageReceived {
        payload: String,
    },
    CallReceived {
        call: Call,
    },
    CallUpdated {
        call: Call,
    },
    UserUpdated {
        user: User,
    },
    CurrentUserChanged {
        user: User,
    },
    PeerError {
        code: u32,
        message: String,
    },
}

pub type Job = Box<dyn FnOnce() + Send + 'static>;
pub type EventHandler = Arc<dyn Fn(&ClientEvent) + Send + Sync + 'static>;

/// Where handler invocations run.
pub trait ExecutionContext: Send + Sync {
    fn post(&self, job: Job);
}

/// Runs every job immediately on the posting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineContext;

impl ExecutionContext for InlineContext {
    fn post(&self, job: Job) {
        job();
    }
}

/// Ordered queue drained by one task on a tokio runtime.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    tx: mpsc::UnboundedSender<Job>,
}

impl RuntimeContext {
    pub fn new(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { tx }
    }
}

impl ExecutionContext for RuntimeContext {
    fn post(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::debug!("event dropped; runtime context has shut down");
        }
    }
}

/// The runtime we are called from, or inline delivery outside of one.
pub fn capture_current() -> Arc<dyn ExecutionContext> {
    match Handle::try_current() {
        Ok(handle) => Arc::new(RuntimeContext::new(&handle)),
        Err(_) => Arc::new(InlineContext),
    }
}

#[derive(Clone)]
pub struct EventHub {
    context: Arc<dyn ExecutionContext>,
    handlers: Arc<Mutex<Vec<EventHandler>>>,
    broadcast: broadcast::Sender<ClientEvent>,
}

impl EventHub {
    pub fn new(context: Arc<dyn ExecutionContext>, buffer: usize) -> Self {
        let (broadcast, _) = broadcast::channel(buffer.max(1));
        Self {
            context,
            handlers: Arc::new(Mutex::new(Vec::new())),
            broadcast,
        }
    }

    pub fn add_handler(&self, handler: EventHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.broadcast.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        // No receivers is not an error here.
        let _ = self.broadcast.send(event.clone());

        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if handlers.is_empty() {
            return;
        }
        self.context.post(Box::new(move || {
            for handler in &handlers {
                handler(&event);
            }
        }));
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("receivers", &self.broadcast.receiver_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_hub(context: Arc<dyn ExecutionContext>) -> (EventHub, Arc<Mutex<Vec<ClientEvent>>>) {
        let hub = EventHub::new(context, 16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.add_handler(Arc::new(move |event: &ClientEvent| {
            sink.lock().unwrap().push(event.clone());
        }));
        (hub, seen)
    }

    #[test]
    fn inline_context_runs_handlers_synchronously() {
        let (hub, seen) = recording_hub(Arc::new(InlineContext));
        hub.emit(ClientEvent::StatusChanged {
            status: ConnectionStatus::Attached,
        });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn capture_outside_runtime_is_inline() {
        let (hub, seen) = recording_hub(capture_current());
        hub.emit(ClientEvent::MessageReceived {
            payload: "SKYPEVERSION 7.0".to_string(),
        });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn runtime_context_preserves_order() {
        let (hub, seen) = recording_hub(capture_current());
        let mut rx = hub.subscribe();
        for i in 0..5 {
            hub.emit(ClientEvent::PeerError {
                code: i,
                message: String::new(),
            });
        }
        for i in 0..5 {
            assert!(matches!(rx.recv().await.unwrap(), ClientEvent::PeerError { code, .. } if code == i));
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let codes: Vec<u32> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ClientEvent::PeerError { code, .. } => Some(*code),
                _ => None,
            })
            .collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(ClientEvent::StatusChanging {
            from: ConnectionStatus::Discovering,
            to: ConnectionStatus::Attached,
        })
        .unwrap();
        assert_eq!(json["type"], "status_changing");
        assert_eq!(json["to"], "Attached");
    }
}
