//! Start / stop notifications for the embedding application.

use std::sync::{Arc, RwLock};

/// Called with each item started on this node.
pub type StartListener<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// Called with the batch of items stopped on this node.
pub type StopListener<P> = Arc<dyn Fn(&[P]) + Send + Sync>;

/// Registered listeners. Cloning shares the registrations.
pub struct Listeners<P> {
    start: Arc<RwLock<Vec<StartListener<P>>>>,
    stop: Arc<RwLock<Vec<StopListener<P>>>>,
}

impl<P> Clone for Listeners<P> {
    fn clone(&self) -> Self {
        Self {
            start: Arc::clone(&self.start),
            stop: Arc::clone(&self.stop),
        }
    }
}

impl<P> Default for Listeners<P> {
    fn default() -> Self {
        Self {
            start: Arc::new(RwLock::new(Vec::new())),
            stop: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<P> Listeners<P> {
    pub fn add_start(&self, listener: StartListener<P>) {
        self.start
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn add_stop(&self, listener: StopListener<P>) {
        self.stop
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub(crate) fn started(&self, payload: &P) {
        // Copy out so a listener may register further listeners.
        let listeners = self
            .start
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener(payload);
        }
    }

    pub(crate) fn stopped(&self, payloads: &[P]) {
        let listeners = self
            .stop
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener(payloads);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn every_listener_is_notified() {
        let listeners = Listeners::<u32>::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            listeners.add_start(Arc::new(move |p: &u32| seen.lock().unwrap().push((tag, *p))));
        }
        listeners.started(&7);

        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn stop_listener_receives_whole_batch() {
        let listeners = Listeners::<u32>::default();
        let batches = Arc::new(Mutex::new(Vec::new()));
        {
            let batches = Arc::clone(&batches);
            listeners.add_stop(Arc::new(move |ps: &[u32]| batches.lock().unwrap().push(ps.to_vec())));
        }

        listeners.clone().stopped(&[1, 2, 3]);
        assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3]]);
    }
}
