use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::domains::message::Message;
use crate::error::{ForemanBotError, Result};

/// Single source of truth mapping a live command id to its one-shot delivery
/// slot. Shared by the dispatcher and every transport receive loop; delivery
/// is at-most-once per id, and resolving an id that was already resolved or
/// cancelled is a no-op.
#[derive(Default)]
pub struct CommandRegistry {
    waiters: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must happen-before the corresponding publish. A second register for an
    /// id still in flight is a programmer error.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<Message>> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.lock();
        if waiters.contains_key(id) {
            return Err(ForemanBotError::Runtime(format!(
                "command {id} already has a live waiter"
            )));
        }
        waiters.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Called by transport receive loops. Returns true iff a waiter existed
    /// and the message was handed to it; the sender is removed either way,
    /// so concurrent resolution attempts race safely.
    pub fn resolve(&self, id: &str, message: Message) -> bool {
        let sender = self.lock().remove(id);
        match sender {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Removes the waiter without delivery (timeout / deadline path).
    pub fn cancel(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Message>>> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::message::MessageType;
    use serde_json::Value;

    fn reply(id: &str) -> Message {
        let mut message = Message::new(MessageType::CpuTempResponse, "key", Value::Null);
        message.id = id.to_string();
        message
    }

    #[tokio::test]
    async fn delivers_exactly_once() {
        let registry = CommandRegistry::new();
        let rx = registry.register("abc").unwrap();
        assert!(registry.resolve("abc", reply("abc")));
        let got = rx.await.unwrap();
        assert_eq!(got.id, "abc");
        // second resolve after delivery is a no-op, not an error
        assert!(!registry.resolve("abc", reply("abc")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_register_fails() {
        let registry = CommandRegistry::new();
        let _rx = registry.register("abc").unwrap();
        assert!(registry.register("abc").is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn cancel_removes_without_delivery() {
        let registry = CommandRegistry::new();
        let mut rx = registry.register("abc").unwrap();
        registry.cancel("abc");
        assert!(registry.is_empty());
        assert!(rx.try_recv().is_err());
        // a reply arriving after cancellation is dropped
        assert!(!registry.resolve("abc", reply("abc")));
    }

    #[tokio::test]
    async fn unknown_id_is_dropped() {
        let registry = CommandRegistry::new();
        assert!(!registry.resolve("zzz", reply("zzz")));
    }

    #[tokio::test]
    async fn concurrent_resolvers_deliver_to_one() {
        use std::sync::Arc;
        let registry = Arc::new(CommandRegistry::new());
        let rx = registry.register("abc").unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.resolve("abc", reply("abc"))
            }));
        }
        let mut delivered = 0;
        for handle in handles {
            if handle.await.unwrap() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
        assert_eq!(rx.await.unwrap().id, "abc");
    }
}
