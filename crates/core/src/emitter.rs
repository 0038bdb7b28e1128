//! The event emitter: the single choke point between the loop and the
//! world.
//!
//! `emit` always runs in this exact order: (1) durable WAL append,
//! (2) synchronous observer hooks (fail-open), (3) yield to the
//! streaming consumer (backpressure). External observers therefore
//! never see an event before it is durable, and always in WAL order.

use std::sync::Arc;

use sr_domain::{Error, Event, Result};
use sr_wal::{WalLocator, WalWriter};
use tokio::sync::mpsc;

pub type ObserverHook = Arc<dyn Fn(&Event) + Send + Sync>;

pub struct Emitter {
    wal: WalWriter,
    hooks: Vec<ObserverHook>,
    consumer: mpsc::Sender<Event>,
    terminal_emitted: bool,
}

impl Emitter {
    pub fn new(wal: WalWriter, hooks: Vec<ObserverHook>, consumer: mpsc::Sender<Event>) -> Self {
        Self { wal, hooks, consumer, terminal_emitted: false }
    }

    pub fn locator(&self) -> &WalLocator {
        self.wal.locator()
    }

    /// Append durably, fan out, then hand to the consumer. Returns the
    /// event's WAL line index. Emitting after a terminal event is a
    /// loop bug and fails hard.
    pub async fn emit(&mut self, event: Event) -> Result<u64> {
        if self.terminal_emitted {
            return Err(Error::Validation(format!(
                "event {:?} after terminal for run {}",
                event.kind, event.run_id
            )));
        }

        let index = self.wal.append(&event)?;

        for hook in &self.hooks {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(&event)));
            if outcome.is_err() {
                tracing::warn!(kind = ?event.kind, "observer hook panicked; continuing");
            }
        }

        if event.is_terminal() {
            self.terminal_emitted = true;
        }
        // A dropped consumer is fine: the WAL remains the record.
        let _ = self.consumer.send(event).await;
        Ok(index)
    }

    pub fn terminal_emitted(&self) -> bool {
        self.terminal_emitted
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sr_domain::EventKind;

    fn event(kind: EventKind) -> Event {
        Event::now(kind, "r1", serde_json::json!({}))
    }

    #[tokio::test]
    async fn emit_appends_then_fans_out_then_streams() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), "r1").unwrap();
        let seen: Arc<Mutex<Vec<sr_domain::EventKind>>> = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        let hook: ObserverHook = Arc::new(move |e: &Event| hook_seen.lock().push(e.kind));
        let (tx, mut rx) = mpsc::channel(8);

        let mut emitter = Emitter::new(wal, vec![hook], tx);
        assert_eq!(emitter.emit(event(EventKind::RunStarted)).await.unwrap(), 0);
        assert_eq!(emitter.emit(event(EventKind::PromptCompiled)).await.unwrap(), 1);

        assert_eq!(*seen.lock(), vec![EventKind::RunStarted, EventKind::PromptCompiled]);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::RunStarted);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::PromptCompiled);

        // Durable before observed: the WAL already holds both lines.
        let events = sr_wal::read_prefix(dir.path(), "r1", Default::default()).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn hook_panic_does_not_abort_emit() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), "r1").unwrap();
        let hook: ObserverHook = Arc::new(|_| panic!("observer bug"));
        let (tx, mut rx) = mpsc::channel(8);

        let mut emitter = Emitter::new(wal, vec![hook], tx);
        emitter.emit(event(EventKind::RunStarted)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::RunStarted);
    }

    #[tokio::test]
    async fn nothing_after_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), "r1").unwrap();
        let (tx, _rx) = mpsc::channel(8);

        let mut emitter = Emitter::new(wal, vec![], tx);
        emitter.emit(event(EventKind::RunCompleted)).await.unwrap();
        assert!(emitter.terminal_emitted());
        let err = emitter.emit(event(EventKind::LlmResponseDelta)).await.unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Validation);

        // The WAL holds exactly the terminal event.
        let events = sr_wal::read_prefix(dir.path(), "r1", Default::default()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn dropped_consumer_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), "r1").unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let mut emitter = Emitter::new(wal, vec![], tx);
        emitter.emit(event(EventKind::RunStarted)).await.unwrap();
        emitter.emit(event(EventKind::RunCompleted)).await.unwrap();
    }
}
