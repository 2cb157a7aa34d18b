//! Change notifications for KV mutations.
//!
//! The bus is how UI state reacts to storage without polling: the store
//! dispatches after every successful `set`/`delete`, and any component may
//! subscribe to a [`Topic`] without the writer knowing about it.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::keys::Topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Set,
    Del,
}

/// Payload handed to listeners after a mutation commits.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: String,
    pub kind: ChangeKind,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

type Callback = Arc<dyn Fn(&ChangeEvent) -> crate::Result<()> + Send + Sync>;

struct ListenerEntry {
    topic: Topic,
    name: Option<String>,
    callback: Callback,
}

/// Listener registry with synchronous, in-registration-order dispatch.
///
/// At most one callback may be registered under a given `(topic, name)`
/// pair; re-registering with the same name replaces the callback in place.
/// Anonymous listeners always append.
#[derive(Clone, Default)]
pub struct ChangeBus {
    listeners: Arc<Mutex<Vec<ListenerEntry>>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&self, topic: Topic, name: Option<&str>, callback: F)
    where
        F: Fn(&ChangeEvent) -> crate::Result<()> + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let mut listeners = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(name) = name {
            if let Some(entry) = listeners
                .iter_mut()
                .find(|e| e.topic == topic && e.name.as_deref() == Some(name))
            {
                entry.callback = callback;
                return;
            }
        }
        listeners.push(ListenerEntry {
            topic,
            name: name.map(str::to_string),
            callback,
        });
    }

    pub fn remove_listener(&self, topic: Topic, name: &str) {
        let mut listeners = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.retain(|e| !(e.topic == topic && e.name.as_deref() == Some(name)));
    }

    /// Invoke every listener whose topic matches the mutated key.
    ///
    /// A failing listener is logged and must not prevent later listeners
    /// from running. Callbacks are invoked outside the registry lock so a
    /// listener may subscribe or unsubscribe reentrantly.
    pub fn dispatch(&self, event: &ChangeEvent) {
        let topic = Topic::for_key(&event.key);
        let callbacks: Vec<Callback> = {
            let listeners = match self.listeners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            listeners
                .iter()
                .filter(|e| e.topic == topic)
                .map(|e| e.callback.clone())
                .collect()
        };
        for callback in callbacks {
            if let Err(err) = callback(event) {
                tracing::warn!(key = %event.key, error = %err, "change listener failed");
            }
        }
    }
}
