//! Registered behaviors: (callback, user data, event filter, handle filter).
//!
//! Every event the session dispatches is offered to each registered behavior
//! in registration order.  A behavior fires when both its filters match.
//! Callbacks and user data are compared by identity, so removing a behavior
//! needs the same `Arc`s that were used to add it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use ncl_core::{EventFilter, HandleFilter, NclError, NclEvent};

use crate::application::session::Ncl;

/// Application callback.  Receives the session, the event, and the user data
/// of the behavior that matched.
pub type Callback = Arc<dyn Fn(&Ncl, &NclEvent, &UserData) + Send + Sync>;

/// Wraps a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Ncl, &NclEvent, &UserData) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Opaque application data handed back to a callback.
///
/// Two values are equal when they are both empty or point at the same
/// allocation.
#[derive(Clone, Default)]
pub struct UserData(Option<Arc<dyn Any + Send + Sync>>);

impl UserData {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(Some(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|value| value.downcast_ref::<T>())
    }

    fn address(&self) -> Option<*const ()> {
        self.0.as_ref().map(|value| Arc::as_ptr(value) as *const ())
    }
}

impl PartialEq for UserData {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for UserData {}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(address) => write!(f, "UserData({address:p})"),
            None => f.write_str("UserData(none)"),
        }
    }
}

/// One registered reaction to events.
#[derive(Clone)]
pub struct Behavior {
    pub callback: Callback,
    pub user_data: UserData,
    pub event: EventFilter,
    pub handle: HandleFilter,
}

impl Behavior {
    pub fn new(callback: Callback, user_data: UserData, event: EventFilter, handle: HandleFilter) -> Self {
        Self {
            callback,
            user_data,
            event,
            handle,
        }
    }

    /// Returns `true` if this behavior fires for `event`.
    pub fn matches(&self, event: &NclEvent) -> bool {
        self.event.matches(event.kind()) && self.handle.matches(event.handle())
    }

    fn callback_address(&self) -> *const () {
        Arc::as_ptr(&self.callback) as *const ()
    }
}

impl PartialEq for Behavior {
    fn eq(&self, other: &Self) -> bool {
        self.callback_address() == other.callback_address()
            && self.user_data == other.user_data
            && self.event == other.event
            && self.handle == other.handle
    }
}

impl Eq for Behavior {}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behavior")
            .field("callback", &self.callback_address())
            .field("user_data", &self.user_data)
            .field("event", &self.event)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Ordered set of behaviors.
#[derive(Debug, Default)]
pub struct BehaviorRegistry {
    behaviors: Vec<Behavior>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`NclError::BadValue`] if an identical behavior is registered.
    pub fn add(&mut self, behavior: Behavior) -> Result<(), NclError> {
        if self.behaviors.contains(&behavior) {
            return Err(NclError::BadValue("behavior is already registered".to_string()));
        }
        self.behaviors.push(behavior);
        Ok(())
    }

    /// Removes the behavior equal to `behavior`.
    ///
    /// # Errors
    ///
    /// Returns [`NclError::BadValue`] if no registered behavior matches exactly.
    pub fn remove(&mut self, behavior: &Behavior) -> Result<(), NclError> {
        let index = self
            .behaviors
            .iter()
            .position(|b| b == behavior)
            .ok_or_else(|| NclError::BadValue("behavior is not registered".to_string()))?;
        self.behaviors.remove(index);
        Ok(())
    }

    /// Snapshot of the behaviors that fire for `event`, in registration order.
    pub fn matching(&self, event: &NclEvent) -> Vec<Behavior> {
        self.behaviors.iter().filter(|b| b.matches(event)).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.behaviors.clear();
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }
}
