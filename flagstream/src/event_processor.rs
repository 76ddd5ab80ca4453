//! Asynchronous event shipping: a bounded inbox, a single dispatcher task
//! and a small pool of flush workers with backpressure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::Event;
use crate::sender::Sender;
use crate::task::RepeatableTask;

/// Messages drained by the dispatcher per wakeup.
const MESSAGE_BATCH_SIZE: usize = 50;
/// Events per HTTP request.
const MAX_EVENTS_PER_REQUEST: usize = 50;
/// Concurrent flush workers.
const MAX_FLUSH_WORKERS: usize = 5;

/// A component that accepts analytics events and ships them eventually.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    /// Queue an event without blocking; may drop under pressure.
    fn send_event(&self, event: Event);

    /// Schedule the next delivery as soon as possible.
    fn flush(&self);

    /// Deliver pending events and shut down. Idempotent.
    async fn stop(&self);
}

enum InboxMessage {
    Event(Event),
    Flush,
    Shutdown(oneshot::Sender<()>),
}

/// The default processor backed by an HTTP sender.
pub struct DefaultEventProcessor {
    inbox: mpsc::Sender<InboxMessage>,
    closed: AtomicBool,
    flush_task: RepeatableTask,
}

impl DefaultEventProcessor {
    pub fn new(config: &Config, sender: Arc<dyn Sender>) -> Self {
        let (inbox, outbox) = mpsc::channel(config.events_max_in_queue());
        tokio::spawn(dispatch_loop(outbox, sender, config.events_url()));

        let flush_inbox = inbox.clone();
        let flush_task = RepeatableTask::spawn(
            "events flush",
            Duration::from_secs_f64(config.events_flush_interval()),
            move || {
                enqueue(&flush_inbox, InboxMessage::Flush);
            },
        );
        debug!("event processor is ready");
        Self {
            inbox,
            closed: AtomicBool::new(false),
            flush_task,
        }
    }
}

/// Non-blocking enqueue; events beyond the inbox capacity are dropped.
fn enqueue(inbox: &mpsc::Sender<InboxMessage>, message: InboxMessage) -> bool {
    match inbox.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("events are produced faster than they can be processed; some will be dropped");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[async_trait]
impl EventProcessor for DefaultEventProcessor {
    fn send_event(&self, event: Event) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        enqueue(&self.inbox, InboxMessage::Event(event));
    }

    fn flush(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        enqueue(&self.inbox, InboxMessage::Flush);
    }

    async fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("event processor is stopping");
        self.flush_task.stop().await;
        // One final flush, then a shutdown rendezvous: unlike normal events
        // the shutdown message waits for inbox space and for completion.
        enqueue(&self.inbox, InboxMessage::Flush);
        let (done, completed) = oneshot::channel();
        if self.inbox.send(InboxMessage::Shutdown(done)).await.is_ok() {
            let _ = completed.await;
        }
    }
}

async fn dispatch_loop(
    mut inbox: mpsc::Receiver<InboxMessage>,
    sender: Arc<dyn Sender>,
    events_url: String,
) {
    debug!("event dispatcher is working");
    let permits = Arc::new(Semaphore::new(MAX_FLUSH_WORKERS));
    let mut buffer: Vec<Event> = Vec::new();
    'dispatch: loop {
        let Some(first) = inbox.recv().await else {
            break;
        };
        let mut batch = Vec::with_capacity(MESSAGE_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MESSAGE_BATCH_SIZE {
            match inbox.try_recv() {
                Ok(message) => batch.push(message),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        for message in batch {
            match message {
                InboxMessage::Event(event) => {
                    if event.is_send_event() {
                        buffer.push(event);
                    }
                }
                InboxMessage::Flush => trigger_flush(&mut buffer, &permits, &sender, &events_url),
                InboxMessage::Shutdown(done) => {
                    shutdown(&permits, sender.as_ref()).await;
                    let _ = done.send(());
                    break 'dispatch;
                }
            }
        }
    }
    debug!("event dispatcher exited");
}

/// Hand the buffered events to a flush worker if one is free; otherwise the
/// buffer is retained for the next flush.
fn trigger_flush(
    buffer: &mut Vec<Event>,
    permits: &Arc<Semaphore>,
    sender: &Arc<dyn Sender>,
    events_url: &str,
) {
    if buffer.is_empty() {
        return;
    }
    match permits.clone().try_acquire_owned() {
        Ok(permit) => {
            let payload = std::mem::take(buffer);
            let sender = sender.clone();
            let events_url = events_url.to_string();
            tokio::spawn(async move {
                flush_payload(sender.as_ref(), &events_url, payload).await;
                drop(permit);
            });
        }
        Err(_) => debug!("no flush worker available, keeping events buffered"),
    }
}

/// Ship a payload in batches. Send failures drop the remaining events: this
/// is telemetry, delivery is fire-and-forget.
async fn flush_payload(sender: &dyn Sender, events_url: &str, payload: Vec<Event>) -> bool {
    for chunk in payload.chunks(MAX_EVENTS_PER_REQUEST) {
        let body = Value::Array(chunk.iter().map(Event::to_json).collect()).to_string();
        match sender.post_json(events_url, body, false).await {
            Ok(_) => debug!(size = chunk.len(), "events payload sent"),
            Err(error) => {
                warn!(error = %error, "failed to send events payload, dropping batch");
                return false;
            }
        }
    }
    true
}

/// Wait for in-flight flushes, then close the sender.
async fn shutdown(permits: &Arc<Semaphore>, sender: &dyn Sender) {
    debug!("event dispatcher is cleaning up workers and sender");
    let _drain = permits
        .acquire_many(MAX_FLUSH_WORKERS as u32)
        .await
        .expect("flush semaphore closed");
    sender.stop().await;
}

/// Processor used in offline mode: accepts and discards everything.
#[derive(Debug, Default)]
pub struct NullEventProcessor;

#[async_trait]
impl EventProcessor for NullEventProcessor {
    fn send_event(&self, _event: Event) {}

    fn flush(&self) {}

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::SendError;
    use crate::user::User;
    use std::sync::Mutex;

    fn config() -> Config {
        Config::builder("secret", "http://events.local", "ws://stream.local")
            .events_flush_interval(0.05)
            .build()
    }

    fn user_event(key: &str) -> Event {
        Event::user(User::builder(key).name(key).build().unwrap())
    }

    /// Records posted payloads; optionally fails every send.
    struct RecordingSender {
        payloads: Mutex<Vec<Vec<Value>>>,
        failing: AtomicBool,
        stopped: AtomicBool,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                payloads: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            })
        }

        fn user_keys(&self) -> Vec<String> {
            self.payloads
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .map(|payload| payload["user"]["keyId"].as_str().unwrap().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl Sender for RecordingSender {
        async fn post_json(
            &self,
            _url: &str,
            body: String,
            _fetch_response: bool,
        ) -> Result<Option<String>, SendError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SendError("forced failure".to_string()));
            }
            let payload: Vec<Value> = serde_json::from_str(&body).unwrap();
            self.payloads.lock().unwrap().push(payload);
            Ok(None)
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_events_flow_through_flush() {
        let sender = RecordingSender::new();
        let processor = DefaultEventProcessor::new(&config(), sender.clone());
        processor.send_event(user_event("test-user-1"));
        processor.send_event(user_event("test-user-2"));
        processor.flush();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let keys = sender.user_keys();
        assert!(keys.contains(&"test-user-1".to_string()));
        assert!(keys.contains(&"test-user-2".to_string()));
        processor.stop().await;
        assert!(sender.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_periodic_flush_delivers_without_manual_flush() {
        let sender = RecordingSender::new();
        let processor = DefaultEventProcessor::new(&config(), sender.clone());
        processor.send_event(user_event("test-user-1"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sender.user_keys().contains(&"test-user-1".to_string()));
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_failed_batches_are_dropped_silently() {
        let sender = RecordingSender::new();
        let processor = DefaultEventProcessor::new(&config(), sender.clone());
        sender.failing.store(true, Ordering::SeqCst);
        processor.send_event(user_event("lost-user"));
        processor.flush();
        tokio::time::sleep(Duration::from_millis(100)).await;

        sender.failing.store(false, Ordering::SeqCst);
        processor.send_event(user_event("kept-user"));
        processor.flush();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let keys = sender.user_keys();
        assert!(!keys.contains(&"lost-user".to_string()));
        assert!(keys.contains(&"kept-user".to_string()));
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_nothing_is_sent_after_stop() {
        let sender = RecordingSender::new();
        let processor = DefaultEventProcessor::new(&config(), sender.clone());
        processor.stop().await;
        assert!(sender.stopped.load(Ordering::SeqCst));
        processor.send_event(user_event("late-user"));
        processor.flush();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sender.user_keys().is_empty());
        // A second stop is a no-op.
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ships_buffered_events() {
        let sender = RecordingSender::new();
        let processor = DefaultEventProcessor::new(&config(), sender.clone());
        processor.send_event(user_event("buffered-user"));
        processor.stop().await;
        assert!(sender.user_keys().contains(&"buffered-user".to_string()));
    }

    #[tokio::test]
    async fn test_empty_flag_events_are_not_buffered() {
        let sender = RecordingSender::new();
        let processor = DefaultEventProcessor::new(&config(), sender.clone());
        let user = User::builder("u-1").name("u-1").build().unwrap();
        processor.send_event(Event::flag(user));
        processor.flush();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sender.user_keys().is_empty());
        processor.stop().await;
    }
}
