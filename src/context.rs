//! Job context: the thread-safe data-sharing scope of a workflow run

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::hooks::{HookDispatch, MessageHook, NotificationManager};
use crate::job::JobId;
use crate::{AutoJobError, Result};

/// A stored value together with the name of its declared type
#[derive(Clone)]
struct StoredValue {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Shared key/value store plus bookkeeping for the jobs of one run
///
/// All operations take `&self`; the value map is a sharded concurrent map and
/// the processed list has its own lock, so jobs running in parallel never
/// serialise on a single context-wide lock.
pub struct JobContext {
    parent: JobId,
    processed: RwLock<Vec<JobId>>,
    values: DashMap<String, StoredValue>,
    hooks: Arc<NotificationManager>,
}

impl JobContext {
    /// Context bound to the process-wide notification manager
    pub fn new(parent: JobId) -> Self {
        Self::with_hooks(parent, NotificationManager::shared())
    }

    /// Context bound to an explicit notification manager
    pub fn with_hooks(parent: JobId, hooks: Arc<NotificationManager>) -> Self {
        Self {
            parent,
            processed: RwLock::new(Vec::new()),
            values: DashMap::new(),
            hooks,
        }
    }

    /// Identifier of the job this context was created for
    pub fn parent_id(&self) -> &JobId {
        &self.parent
    }

    /// Manager receiving pushes made through this context
    pub fn hooks(&self) -> &Arc<NotificationManager> {
        &self.hooks
    }

    /// Read a value; an unset key yields `T::default()`
    pub fn get_value<T>(&self, key: &str) -> Result<T>
    where
        T: Any + Clone + Default + Send + Sync,
    {
        Self::check_key(key)?;

        let Some(entry) = self.values.get(key) else {
            return Ok(T::default());
        };

        match entry.value.downcast_ref::<T>() {
            Some(value) => Ok(value.clone()),
            None => Err(AutoJobError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
                found: entry.type_name,
            }),
        }
    }

    /// Add or overwrite the value stored under `key`
    pub fn set_value<T>(&self, value: T, key: &str) -> Result<()>
    where
        T: Any + Send + Sync,
    {
        Self::check_key(key)?;

        self.values.insert(
            key.to_string(),
            StoredValue {
                value: Arc::new(value),
                type_name: type_name::<T>(),
            },
        );
        Ok(())
    }

    /// Whether a value is stored under `key`
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Drop a key; returns whether it was present
    pub fn remove_value(&self, key: &str) -> Result<bool> {
        Self::check_key(key)?;
        Ok(self.values.remove(key).is_some())
    }

    /// Record that `id` ran against this context
    pub fn add_to_processed(&self, id: JobId) {
        self.processed.write().push(id);
    }

    /// Jobs recorded so far, in recording order
    pub fn processed_jobs(&self) -> Vec<JobId> {
        self.processed.read().clone()
    }

    /// Forward a progress message to the notification manager without waiting
    /// for any handler.
    pub fn push_report_to_hook(&self, sender: &JobId, message: MessageHook) -> HookDispatch {
        debug!(sender = %sender, kind = ?message.message_type(), "Pushing report to hooks");
        self.hooks.push(sender, message)
    }

    fn check_key(key: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(AutoJobError::InvalidArgument(
                "context key must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("parent", &self.parent)
            .field("keys", &self.values.len())
            .field("processed", &self.processed.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn context() -> JobContext {
        JobContext::with_hooks(
            JobId::new("ctx", "test").unwrap(),
            Arc::new(NotificationManager::new()),
        )
    }

    #[test]
    fn test_set_then_get_round_trips() {
        let ctx = context();
        ctx.set_value("token-123".to_string(), "auth").unwrap();
        ctx.set_value(42u32, "count").unwrap();

        assert_eq!(ctx.get_value::<String>("auth").unwrap(), "token-123");
        assert_eq!(ctx.get_value::<u32>("count").unwrap(), 42);
    }

    #[test]
    fn test_missing_key_yields_default() {
        let ctx = context();
        assert_eq!(ctx.get_value::<u64>("missing").unwrap(), 0);
        assert_eq!(ctx.get_value::<String>("missing").unwrap(), "");
        assert_eq!(ctx.get_value::<Option<bool>>("missing").unwrap(), None);
    }

    #[test]
    fn test_blank_keys_are_rejected() {
        let ctx = context();
        assert!(matches!(
            ctx.set_value(1i32, " "),
            Err(AutoJobError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctx.get_value::<i32>(""),
            Err(AutoJobError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let ctx = context();
        ctx.set_value(1i64, "n").unwrap();

        match ctx.get_value::<String>("n") {
            Err(AutoJobError::TypeMismatch { key, found, .. }) => {
                assert_eq!(key, "n");
                assert_eq!(found, "i64");
            }
            other => panic!("expected type mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_value() {
        let ctx = context();
        ctx.set_value(true, "flag").unwrap();
        assert!(ctx.contains_key("flag"));
        assert!(ctx.remove_value("flag").unwrap());
        assert!(!ctx.remove_value("flag").unwrap());
        assert!(!ctx.get_value::<bool>("flag").unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_do_not_lose_updates() {
        let ctx = Arc::new(context());
        let mut handles = Vec::new();

        for i in 0..16 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    ctx.set_value(j, &format!("k-{}-{}", i, j)).unwrap();
                }
                ctx.add_to_processed(JobId::new(format!("job-{}", i), "writer").unwrap());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ctx.processed_jobs().len(), 16);
        assert_eq!(ctx.get_value::<i32>("k-15-49").unwrap(), 49);
    }
}
