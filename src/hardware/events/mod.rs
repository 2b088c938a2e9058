//! Typed event dispatchers for the hardware pump's three streams
//! (frame-received, frame-transmitted, periodic-tick). Listeners are shared
//! closures removed by handle; the registry lock is never held while a
//! listener runs.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identifies one registered listener for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerHandle(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of listeners invoked with a borrowed payload.
pub struct EventDispatcher<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_handle: AtomicU64,
}

impl<T> EventDispatcher<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(0),
        }
    }

    /// Register a listener and return the handle that removes it.
    pub fn add_listener(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .push((handle, Arc::new(listener)));
        ListenerHandle(handle)
    }

    /// Remove a listener. Returns `false` when the handle is unknown.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != handle.0);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Invoke every listener with `payload`. The registry is snapshotted
    /// under the lock and the calls happen without it, so listeners may
    /// register or remove listeners themselves.
    pub fn invoke(&self, payload: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(payload);
        }
    }
}

impl<T> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_fire_in_registration_order() {
        let dispatcher = EventDispatcher::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        dispatcher.add_listener(move |value| first.lock().unwrap().push(("first", *value)));
        let second = Arc::clone(&order);
        dispatcher.add_listener(move |value| second.lock().unwrap().push(("second", *value)));

        dispatcher.invoke(&7);
        assert_eq!(*order.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn removed_listeners_stop_firing() {
        let dispatcher = EventDispatcher::<()>::new();
        let count = Arc::new(Mutex::new(0));
        let counted = Arc::clone(&count);
        let handle = dispatcher.add_listener(move |_| *counted.lock().unwrap() += 1);

        dispatcher.invoke(&());
        assert!(dispatcher.remove_listener(handle));
        assert!(!dispatcher.remove_listener(handle));
        dispatcher.invoke(&());

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[test]
    fn listeners_may_remove_themselves_mid_invoke() {
        let dispatcher = Arc::new(EventDispatcher::<()>::new());
        let handle = Arc::new(Mutex::new(None::<ListenerHandle>));

        let dispatcher_in_listener = Arc::clone(&dispatcher);
        let handle_in_listener = Arc::clone(&handle);
        let registered = dispatcher.add_listener(move |_| {
            if let Some(handle) = *handle_in_listener.lock().unwrap() {
                dispatcher_in_listener.remove_listener(handle);
            }
        });
        *handle.lock().unwrap() = Some(registered);

        dispatcher.invoke(&());
        assert_eq!(dispatcher.listener_count(), 0);
    }
}
