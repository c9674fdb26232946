//! Callback lists for host-facing streams.
//!
//! A panicking callback is caught and logged; the remaining callbacks still
//! run and the machine stays consistent.

use std::panic::{self, AssertUnwindSafe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Box<dyn FnMut(&T) + Send>;

pub struct Observers<T> {
    stream: &'static str,
    next_id: u64,
    entries: Vec<(SubscriptionId, Callback<T>)>,
}

impl<T> Observers<T> {
    pub fn new(stream: &'static str) -> Self {
        Observers {
            stream,
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&T) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notify(&mut self, value: &T) {
        for (id, callback) in self.entries.iter_mut() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(value)));
            if outcome.is_err() {
                tracing::warn!(stream = self.stream, subscription = id.0, "Observer panicked; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn delivers_to_all_subscribers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::new("test");
        for tag in ["a", "b"] {
            let seen = seen.clone();
            observers.subscribe(move |value: &u32| seen.lock().unwrap().push((tag, *value)));
        }
        observers.notify(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn panicking_callback_does_not_stop_others() {
        let seen = Arc::new(Mutex::new(0));
        let mut observers = Observers::new("test");
        observers.subscribe(|_: &u32| panic!("hook failure"));
        let counter = seen.clone();
        observers.subscribe(move |_: &u32| *counter.lock().unwrap() += 1);

        observers.notify(&1);
        observers.notify(&2);
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn unsubscribe_removes_callback() {
        let mut observers = Observers::new("test");
        let id = observers.subscribe(|_: &u32| {});
        assert_eq!(observers.len(), 1);
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        assert!(observers.is_empty());
    }
}
