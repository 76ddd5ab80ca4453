//! Pub/sub notice broadcasting.
//!
//! A dedicated consumer task dispatches each notice synchronously to the
//! listeners registered under its type; a panicking listener is logged and
//! cannot stall the others. The streaming pipeline broadcasts a
//! [`FlagChangedNotice`] for every applied flag change; this channel is the
//! sink for those signals.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Notice type emitted for every applied flag change.
pub const FLAG_CHANGE_NOTICE_TYPE: &str = "flag_change_notice";

/// A broadcastable notification, dispatched by its type tag.
pub trait Notice: Send + Sync + 'static {
    fn notice_type(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

/// Signals that a flag's configuration changed (or a segment it references).
#[derive(Debug, Clone)]
pub struct FlagChangedNotice {
    flag_key: String,
}

impl FlagChangedNotice {
    pub fn new(flag_key: impl Into<String>) -> Self {
        Self {
            flag_key: flag_key.into(),
        }
    }

    pub fn flag_key(&self) -> &str {
        &self.flag_key
    }
}

impl Notice for FlagChangedNotice {
    fn notice_type(&self) -> &str {
        FLAG_CHANGE_NOTICE_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type NoticeListener = Arc<dyn Fn(&dyn Notice) + Send + Sync>;

/// Handle returned by listener registration; used for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    notice_type: String,
    id: u64,
}

type ListenerMap = HashMap<String, Vec<(u64, NoticeListener)>>;

/// Fan-out channel with a single consumer task.
pub struct NoticeBroadcaster {
    queue: Mutex<Option<mpsc::UnboundedSender<Box<dyn Notice>>>>,
    listeners: Arc<RwLock<ListenerMap>>,
    next_id: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for NoticeBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBroadcaster {
    pub fn new() -> Self {
        let (queue, mut incoming) = mpsc::unbounded_channel::<Box<dyn Notice>>();
        let listeners: Arc<RwLock<ListenerMap>> = Arc::new(RwLock::new(HashMap::new()));
        let dispatch_to = listeners.clone();
        debug!("notice broadcaster starting");
        let handle = tokio::spawn(async move {
            while let Some(notice) = incoming.recv().await {
                let targets: Vec<NoticeListener> = {
                    let registry = dispatch_to.read().expect("listener lock poisoned");
                    registry
                        .get(notice.notice_type())
                        .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                        .unwrap_or_default()
                };
                for listener in targets {
                    // One bad listener must not stall the others.
                    if catch_unwind(AssertUnwindSafe(|| listener(notice.as_ref()))).is_err() {
                        error!(
                            notice_type = notice.notice_type(),
                            "notice listener panicked"
                        );
                    }
                }
            }
        });
        Self {
            queue: Mutex::new(Some(queue)),
            listeners,
            next_id: AtomicU64::new(0),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Register a listener for a notice type.
    pub fn add_listener(&self, notice_type: &str, listener: NoticeListener) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(notice_type, "adding a notice listener");
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .entry(notice_type.to_string())
            .or_default()
            .push((id, listener));
        ListenerHandle {
            notice_type: notice_type.to_string(),
            id,
        }
    }

    pub fn remove_listener(&self, handle: &ListenerHandle) {
        let mut registry = self.listeners.write().expect("listener lock poisoned");
        if let Some(entries) = registry.get_mut(&handle.notice_type) {
            entries.retain(|(id, _)| *id != handle.id);
            if entries.is_empty() {
                registry.remove(&handle.notice_type);
            }
        }
    }

    /// Enqueue a notice; delivery order matches enqueue order.
    pub fn broadcast(&self, notice: Box<dyn Notice>) {
        let queue = self.queue.lock().expect("queue lock poisoned");
        if let Some(queue) = queue.as_ref() {
            let _ = queue.send(notice);
        }
    }

    /// Close the channel and join the consumer.
    pub async fn stop(&self) {
        debug!("notice broadcaster stopping");
        self.queue.lock().expect("queue lock poisoned").take();
        let handle = self.handle.lock().expect("handle lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
