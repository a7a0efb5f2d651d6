use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Returns false once it will never take another event
type Listener<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Typed publish/subscribe channel
///
/// Every emitted event is handed to all listeners in the order they were added.
/// Listeners are called outside the internal lock, so they may add listeners themselves.
/// Subscriptions whose receiver was dropped are removed on the next emit.
pub struct Emitter<E> {
    listeners: Arc<Mutex<Vec<Listener<E>>>>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            listeners: Default::default(),
        }
    }
}

impl<E> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl<E: 'static> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `listener` for every event emitted from now on
    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(move |event: &E| {
            listener(event);
            true
        }));
    }

    /// Receive a copy of every event emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E>
    where
        E: Clone + Send,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        self.listeners
            .lock()
            .push(Arc::new(move |event: &E| tx.send(event.clone()).is_ok()));

        rx
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.lock().is_empty()
    }

    pub fn emit(&self, event: E) {
        let listeners = self.listeners.lock().clone();

        let closed: Vec<_> = listeners
            .into_iter()
            .filter(|listener| !listener(&event))
            .collect();

        if !closed.is_empty() {
            self.listeners
                .lock()
                .retain(|listener| !closed.iter().any(|c| Arc::ptr_eq(listener, c)));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fan_out_in_registration_order() {
        let emitter = Emitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let seen = seen.clone();
            emitter.on(move |event| seen.lock().push((id, *event)));
        }

        emitter.emit(7);

        assert_eq!(*seen.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn subscribe_receives_clones() {
        let emitter = Emitter::<String>::new();
        assert!(!emitter.has_listeners());

        let mut rx = emitter.subscribe();
        emitter.emit("accepted".into());

        assert_eq!(rx.try_recv().unwrap(), "accepted");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscription_is_removed() {
        let emitter = Emitter::<u32>::new();
        emitter.on(|_| {});

        let rx = emitter.subscribe();
        let mut kept = emitter.subscribe();
        drop(rx);
        assert_eq!(emitter.listeners.lock().len(), 3);

        emitter.emit(1);
        assert_eq!(emitter.listeners.lock().len(), 2);
        assert_eq!(kept.try_recv().unwrap(), 1);

        drop(kept);
        emitter.emit(2);
        assert_eq!(emitter.listeners.lock().len(), 1);
        assert!(emitter.has_listeners());
    }

    #[test]
    fn listener_may_register_listener() {
        let emitter = Emitter::<()>::new();
        let inner = emitter.clone();

        emitter.on(move |_| inner.on(|_| {}));
        emitter.emit(());

        assert_eq!(emitter.listeners.lock().len(), 2);
    }
}
