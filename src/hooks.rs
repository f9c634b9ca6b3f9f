//! Progress notifications: message hooks and the subscription registry
//!
//! Jobs push [`MessageHook`]s through their context; the
//! [`NotificationManager`] routes each message to every handler subscribed
//! for that sender and message type. Dispatch is fire-and-forget: handlers
//! are synchronous, so each delivery runs on tokio's blocking pool (or on a
//! plain thread outside a runtime) and a failing handler is logged and
//! otherwise ignored.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::job::{panic_message, JobId};
use crate::{AutoJobError, Result};

/// Kind of a progress message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Progress
    Info,
    /// Recoverable problem
    Warning,
    /// Failure
    Error,
    /// Diagnostic detail
    Debug,
    /// Subscription filter matching every message type
    All,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Immutable progress message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHook {
    text: String,
    purpose: String,
    message_type: MessageType,
    created_utc: DateTime<Utc>,
}

impl MessageHook {
    /// Create a message stamped with the current UTC time
    pub fn new(
        text: impl Into<String>,
        purpose: impl Into<String>,
        message_type: MessageType,
    ) -> Result<Self> {
        let text = text.into();
        let purpose = purpose.into();

        if text.trim().is_empty() {
            return Err(AutoJobError::InvalidArgument("message text must not be blank".into()));
        }
        if purpose.trim().is_empty() {
            return Err(AutoJobError::InvalidArgument("message purpose must not be blank".into()));
        }

        Ok(Self {
            text,
            purpose,
            message_type,
            created_utc: Utc::now(),
        })
    }

    /// Message whose purpose label is its type name
    pub(crate) fn report(text: String, message_type: MessageType) -> Self {
        Self {
            purpose: message_type.to_string(),
            text,
            message_type,
            created_utc: Utc::now(),
        }
    }

    /// Message body
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Free-form label describing why the message was sent
    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// Message kind
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Creation time
    pub fn created_utc(&self) -> DateTime<Utc> {
        self.created_utc
    }

    /// Creation time rendered with seven fractional digits
    pub fn timestamp(&self) -> String {
        self.created_utc.format("%Y-%m-%dT%H:%M:%S%.7fZ").to_string()
    }
}

impl fmt::Display for MessageHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #[ Purpose: {} - Type: {} - Message: {} ]#",
            self.timestamp(),
            self.purpose,
            self.message_type,
            self.text
        )
    }
}

/// Receiver of pushed messages
pub trait HookHandler: Send + Sync {
    /// Unique handler id
    fn id(&self) -> &str;

    /// Display name used in logs
    fn name(&self) -> &str;

    /// Handle one message pushed by `sender`
    fn handle(&self, sender: &JobId, message: &MessageHook) -> anyhow::Result<()>;
}

type HandlerFn = dyn Fn(&JobId, &MessageHook) -> anyhow::Result<()> + Send + Sync;

/// Closure-backed handler
pub struct FnHookHandler {
    id: String,
    name: String,
    handler: Box<HandlerFn>,
}

impl FnHookHandler {
    /// Handler named `name` calling `handler` for every delivery
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JobId, &MessageHook) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            handler: Box::new(handler),
        }
    }
}

impl HookHandler for FnHookHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, sender: &JobId, message: &MessageHook) -> anyhow::Result<()> {
        (self.handler)(sender, message)
    }
}

/// Handler that writes every delivered message to the tracing log
pub struct LogHookHandler {
    id: String,
    name: String,
}

impl LogHookHandler {
    /// Handler named `Default-HookHandler`
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: "Default-HookHandler".to_string(),
        }
    }
}

impl Default for LogHookHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl HookHandler for LogHookHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, sender: &JobId, message: &MessageHook) -> anyhow::Result<()> {
        info!(
            sender = %sender,
            handler_id = %self.id,
            handler = %self.name,
            "{}",
            message
        );
        Ok(())
    }
}

#[derive(Debug)]
enum Delivery {
    Task(JoinHandle<()>),
    // Signalled by a delivery thread when no runtime was available.
    Thread(oneshot::Receiver<()>),
}

/// Handles of the deliveries started by one push
///
/// Dropping it leaves the deliveries running.
#[derive(Debug, Default)]
pub struct HookDispatch {
    deliveries: Vec<Delivery>,
}

impl HookDispatch {
    /// Number of handlers the message was routed to
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    /// True when no subscription matched
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Wait until every delivery has finished
    ///
    /// Does not depend on a tokio runtime when the deliveries ran on plain
    /// threads.
    pub async fn join(self) {
        for delivery in self.deliveries {
            match delivery {
                Delivery::Task(handle) => {
                    let _ = handle.await;
                }
                Delivery::Thread(done) => {
                    let _ = done.await;
                }
            }
        }
    }
}

#[derive(Clone)]
struct Subscription {
    receiver: JobId,
    message_type: MessageType,
    handler: Arc<dyn HookHandler>,
}

impl Subscription {
    fn matches(&self, sender: &JobId, message_type: MessageType) -> bool {
        &self.receiver == sender
            && (self.message_type == message_type || self.message_type == MessageType::All)
    }
}

lazy_static! {
    static ref SHARED_MANAGER: Arc<NotificationManager> = Arc::new(NotificationManager::new());
}

/// Registry of hook subscriptions keyed by subscription id
pub struct NotificationManager {
    hooks: DashMap<Uuid, Subscription>,
    // Serialises registrations so duplicate detection and insert are atomic.
    registration: Mutex<()>,
}

impl NotificationManager {
    /// Manager with no subscriptions
    pub fn new() -> Self {
        Self {
            hooks: DashMap::new(),
            registration: Mutex::new(()),
        }
    }

    /// Process-wide manager used by contexts created without an explicit one
    pub fn shared() -> Arc<NotificationManager> {
        SHARED_MANAGER.clone()
    }

    /// Subscribe `handler` to messages of `message_type` sent by `receiver`.
    ///
    /// Registering the same handler instance for the same key and type again
    /// returns the existing subscription id.
    pub fn register_hook(
        &self,
        receiver: JobId,
        message_type: MessageType,
        handler: Arc<dyn HookHandler>,
    ) -> Uuid {
        let _guard = self.registration.lock();

        let existing = self.hooks.iter().find_map(|entry| {
            let sub = entry.value();
            (sub.receiver == receiver
                && sub.message_type == message_type
                && Arc::ptr_eq(&sub.handler, &handler))
            .then(|| *entry.key())
        });
        if let Some(id) = existing {
            return id;
        }

        let id = Uuid::new_v4();
        self.hooks.insert(
            id,
            Subscription {
                receiver,
                message_type,
                handler,
            },
        );
        id
    }

    /// Whether `id` names a live subscription; a nil id is `InvalidArgument`
    pub fn is_registered(&self, id: Uuid) -> Result<bool> {
        if id.is_nil() {
            return Err(AutoJobError::InvalidArgument("subscription id must not be nil".into()));
        }
        Ok(self.hooks.contains_key(&id))
    }

    /// Remove a subscription; unknown ids are ignored
    pub fn remove_hook(&self, id: Uuid) -> Result<()> {
        if id.is_nil() {
            return Err(AutoJobError::InvalidArgument("subscription id must not be nil".into()));
        }
        self.hooks.remove(&id);
        Ok(())
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.hooks.len()
    }

    /// Route `message` to every matching subscription.
    ///
    /// Never runs a handler on the calling thread: each delivery goes to the
    /// runtime's blocking pool, or to a new thread outside a runtime.
    pub fn push(&self, sender: &JobId, message: MessageHook) -> HookDispatch {
        let matches: Vec<Arc<dyn HookHandler>> = self
            .hooks
            .iter()
            .filter(|entry| entry.value().matches(sender, message.message_type()))
            .map(|entry| entry.value().handler.clone())
            .collect();

        if matches.is_empty() {
            return HookDispatch::default();
        }

        let message = Arc::new(message);
        let runtime = tokio::runtime::Handle::try_current();
        let mut deliveries = Vec::with_capacity(matches.len());

        for handler in matches {
            let sender = sender.clone();
            let message = message.clone();
            match &runtime {
                Ok(handle) => deliveries.push(Delivery::Task(handle.spawn_blocking(move || {
                    deliver(handler.as_ref(), &sender, &message);
                }))),
                Err(_) => {
                    let (done, finished) = oneshot::channel();
                    let spawned = thread::Builder::new()
                        .name("hook-delivery".into())
                        .spawn(move || {
                            deliver(handler.as_ref(), &sender, &message);
                            let _ = done.send(());
                        });
                    match spawned {
                        Ok(_) => deliveries.push(Delivery::Thread(finished)),
                        Err(err) => warn!(error = %err, "Failed to spawn hook delivery thread, message dropped"),
                    }
                }
            }
        }

        HookDispatch { deliveries }
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(handler: &dyn HookHandler, sender: &JobId, message: &MessageHook) {
    let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(sender, message)));
    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };

    error!(
        sender_id = %sender.id(),
        sender_name = %sender.name(),
        kind = %message.message_type(),
        handler_id = %handler.id(),
        handler = %handler.name(),
        text = %message.text(),
        error = %failure,
        "Error occurred during hook push"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn HookHandler> {
        Arc::new(FnHookHandler::new("counter", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[test]
    fn test_message_hook_validates_input() {
        assert!(MessageHook::new("", "purpose", MessageType::Info).is_err());
        assert!(MessageHook::new("text", " ", MessageType::Info).is_err());

        let hook = MessageHook::new("started", "progress", MessageType::Warning).unwrap();
        let rendered = hook.to_string();
        assert!(rendered.contains("Purpose: progress - Type: Warning - Message: started"));
        assert!(rendered.ends_with("]#"));
    }

    #[test]
    fn test_register_is_idempotent_for_identical_triples() {
        let manager = NotificationManager::new();
        let key = JobId::new("1", "job").unwrap();
        let handler = counting_handler(Arc::new(AtomicUsize::new(0)));
        let other = counting_handler(Arc::new(AtomicUsize::new(0)));

        let first = manager.register_hook(key.clone(), MessageType::Info, handler.clone());
        let again = manager.register_hook(key.clone(), MessageType::Info, handler.clone());
        let other_type = manager.register_hook(key.clone(), MessageType::Error, handler);
        let other_handler = manager.register_hook(key, MessageType::Info, other);

        assert_eq!(first, again);
        assert_ne!(first, other_type);
        assert_ne!(first, other_handler);
        assert_eq!(manager.subscription_count(), 3);
    }

    #[test]
    fn test_nil_ids_are_invalid() {
        let manager = NotificationManager::new();
        assert!(manager.is_registered(Uuid::nil()).is_err());
        assert!(manager.remove_hook(Uuid::nil()).is_err());
        assert!(manager.remove_hook(Uuid::new_v4()).is_ok());
    }

    #[tokio::test]
    async fn test_push_routes_by_key_and_type() {
        let manager = NotificationManager::new();
        let key = JobId::new("1", "job").unwrap();
        let info = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        manager.register_hook(key.clone(), MessageType::Info, counting_handler(info.clone()));
        manager.register_hook(key.clone(), MessageType::All, counting_handler(all.clone()));

        let msg = MessageHook::new("oops", "test", MessageType::Error).unwrap();
        manager.push(&key, msg).join().await;
        let msg = MessageHook::new("hello", "test", MessageType::Info).unwrap();
        manager.push(&key, msg).join().await;
        let msg = MessageHook::new("hello", "test", MessageType::Info).unwrap();
        let dispatch = manager.push(&JobId::new("2", "job").unwrap(), msg);
        assert!(dispatch.is_empty());

        assert_eq!(info.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        let manager = NotificationManager::new();
        let key = JobId::new("1", "job").unwrap();
        let delivered = Arc::new(AtomicUsize::new(0));

        manager.register_hook(
            key.clone(),
            MessageType::All,
            Arc::new(FnHookHandler::new("broken", |_, _| anyhow::bail!("handler failed"))),
        );
        manager.register_hook(
            key.clone(),
            MessageType::All,
            Arc::new(FnHookHandler::new("panics", |_, _| panic!("boom"))),
        );
        manager.register_hook(key.clone(), MessageType::All, counting_handler(delivered.clone()));

        let dispatch = manager.push(&key, MessageHook::new("x", "y", MessageType::Debug).unwrap());
        assert_eq!(dispatch.len(), 3);
        dispatch.join().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_push_without_runtime_does_not_block() {
        let manager = NotificationManager::new();
        let key = JobId::new("1", "job").unwrap();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        manager.register_hook(
            key.clone(),
            MessageType::Info,
            Arc::new(FnHookHandler::new("slow", move |_, _| {
                thread::sleep(Duration::from_millis(300));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );

        let started = Instant::now();
        let dispatch = manager.push(&key, MessageHook::new("x", "y", MessageType::Info).unwrap());
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(dispatch.len(), 1);

        futures::executor::block_on(dispatch.join());
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_stall_pusher() {
        let manager = NotificationManager::new();
        let key = JobId::new("1", "job").unwrap();
        manager.register_hook(
            key.clone(),
            MessageType::All,
            Arc::new(FnHookHandler::new("slow", |_, _| {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            })),
        );

        let started = Instant::now();
        let dispatch = manager.push(&key, MessageHook::new("x", "y", MessageType::Info).unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_millis(150));
        dispatch.join().await;
    }
}
