use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use courier_messaging::{Message, Selector};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Buffered messages of a single queue (or of one topic subscription).
#[derive(Debug, Default)]
pub(crate) struct MemoryQueue {
    messages: Mutex<VecDeque<Message>>,
    deleted: AtomicBool,
    pub(crate) notify: Notify,
}

impl MemoryQueue {
    pub(crate) fn push(&self, message: Message) {
        self.messages.lock().push_back(message);
        self.notify.notify_waiters();
    }

    /// Removes the highest priority message accepted by `selector`, oldest
    /// first among equal priorities. Expired messages are dropped on the way.
    pub(crate) fn take_matching(
        &self,
        selector: Option<&dyn Selector>,
        now: SystemTime,
    ) -> Option<Message> {
        let mut messages = self.messages.lock();
        messages.retain(|message| !message.is_expired(now));

        let mut best: Option<(usize, u8)> = None;
        for (index, message) in messages.iter().enumerate() {
            if !selector.is_none_or(|selector| selector.matches(message)) {
                continue;
            }
            if best.is_none_or(|(_, priority)| message.priority > priority) {
                best = Some((index, message.priority));
            }
        }

        best.and_then(|(index, _)| messages.remove(index))
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub(crate) fn delete(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.messages.lock().clear();
        self.notify.notify_waiters();
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }
}
