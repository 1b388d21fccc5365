use std::collections::VecDeque;
use std::sync::Mutex;

use blockhost_model::ProcessMessage;
use tokio::sync::mpsc;

/// Multicast stream with a bounded replay cache.
///
/// New subscribers first receive the cached messages, then everything emitted
/// after they subscribed. [`Broadcaster::finish`] emits the terminal `End`,
/// resets the cache to just that marker and closes every subscription.
pub struct Broadcaster<T> {
    inner: Mutex<Inner<T>>,
    replay_max: usize,
}

struct Inner<T> {
    replay: VecDeque<ProcessMessage<T>>,
    subscribers: Vec<mpsc::UnboundedSender<ProcessMessage<T>>>,
    ended: bool,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new(replay_max: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                replay: VecDeque::new(),
                subscribers: Vec::new(),
                ended: false,
            }),
            replay_max: replay_max.max(1),
        }
    }

    pub fn emit(&self, item: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.ended {
            return;
        }
        let msg = ProcessMessage::Io(item);
        if inner.replay.len() >= self.replay_max {
            inner.replay.pop_front();
        }
        inner.replay.push_back(msg.clone());
        inner.subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
    }

    /// Ends the stream. Later calls are ignored.
    pub fn finish(&self, exit_code: Option<i32>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.ended {
            return;
        }
        inner.ended = true;
        let end = ProcessMessage::End { exit_code };
        inner.replay.clear();
        inner.replay.push_back(end.clone());
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(end.clone());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).ended
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for msg in &inner.replay {
            let _ = tx.send(msg.clone());
        }
        if !inner.ended {
            inner.subscribers.push(tx);
        }
        Subscription { rx }
    }
}

/// One reader's view of a [`Broadcaster`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<ProcessMessage<T>>,
}

impl<T> Subscription<T> {
    /// Next message; `None` once the stream has ended and been drained.
    pub async fn recv(&mut self) -> Option<ProcessMessage<T>> {
        self.rx.recv().await
    }

    /// Skips ahead to the terminal marker and returns its exit code.
    pub async fn wait_for_end(mut self) -> Option<i32> {
        while let Some(msg) = self.rx.recv().await {
            if let ProcessMessage::End { exit_code } = msg {
                return exit_code;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io(s: &str) -> ProcessMessage<String> {
        ProcessMessage::Io(s.to_string())
    }

    #[tokio::test]
    async fn late_subscriber_gets_replay_then_live() {
        let b = Broadcaster::<String>::new(10);
        b.emit("one".to_string());
        let mut sub = b.subscribe();
        b.emit("two".to_string());
        assert_eq!(sub.recv().await, Some(io("one")));
        assert_eq!(sub.recv().await, Some(io("two")));
    }

    #[tokio::test]
    async fn replay_is_bounded() {
        let b = Broadcaster::<String>::new(2);
        for s in ["a", "b", "c"] {
            b.emit(s.to_string());
        }
        let mut sub = b.subscribe();
        assert_eq!(sub.recv().await, Some(io("b")));
        assert_eq!(sub.recv().await, Some(io("c")));
    }

    #[tokio::test]
    async fn finish_resets_replay_and_closes() {
        let b = Broadcaster::<String>::new(10);
        let mut early = b.subscribe();
        b.emit("line".to_string());
        b.finish(Some(0));
        b.emit("ignored".to_string());
        b.finish(Some(1));

        assert_eq!(early.recv().await, Some(io("line")));
        assert_eq!(early.recv().await, Some(ProcessMessage::End { exit_code: Some(0) }));
        assert_eq!(early.recv().await, None);

        let mut late = b.subscribe();
        assert_eq!(late.recv().await, Some(ProcessMessage::End { exit_code: Some(0) }));
        assert_eq!(late.recv().await, None);
        assert!(b.is_finished());
    }

    #[tokio::test]
    async fn wait_for_end_skips_lines() {
        let b = Broadcaster::<String>::new(10);
        let sub = b.subscribe();
        b.emit("x".to_string());
        b.finish(None);
        assert_eq!(sub.wait_for_end().await, None);
    }
}
