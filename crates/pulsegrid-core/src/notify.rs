//! Change notification fan-out over channels

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Publishes change events to any number of subscribers.
///
/// Each subscriber owns a [Receiver]; dropping it unsubscribes on the next
/// publish.
#[derive(Debug)]
pub struct Notifier<E> {
    subscribers: Vec<Sender<E>>,
}

impl<E> Default for Notifier<E> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<E: Clone> Notifier<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<E> {
        self.subscribe_with(std::iter::empty())
    }

    /// Subscribe and queue `initial` for the new subscriber only
    pub fn subscribe_with(&mut self, initial: impl IntoIterator<Item = E>) -> Receiver<E> {
        let (tx, rx) = unbounded();
        for event in initial {
            let _ = tx.send(event);
        }
        self.subscribers.push(tx);
        rx
    }

    pub fn notify(&mut self, event: E) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_receives() {
        let mut notifier = Notifier::new();
        let a = notifier.subscribe();
        let b = notifier.subscribe_with([0]);

        notifier.notify(1);

        assert_eq!(a.try_iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(b.try_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut notifier = Notifier::new();
        let kept = notifier.subscribe();
        drop(notifier.subscribe());

        notifier.notify("changed");

        assert_eq!(notifier.subscriber_count(), 1);
        assert_eq!(kept.try_recv(), Ok("changed"));
    }
}
