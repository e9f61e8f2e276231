//! Task records and the work submitted by callers

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;

pub type TaskId = String;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// One step less urgent; `Low` stays `Low`
    pub fn lower(self) -> Self {
        match self {
            TaskPriority::Critical => TaskPriority::High,
            TaskPriority::High => TaskPriority::Normal,
            TaskPriority::Normal | TaskPriority::Low => TaskPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Legal edges of the task state machine
    ///
    /// `Running -> Pending` is the retry edge taken by a failed attempt that
    /// still has retries left.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Running, Cancelled)
        )
    }
}

type AsyncFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync;
type BlockingFn = dyn Fn(Value) -> Result<Value, String> + Send + Sync;

/// The processing function supplied with a task
///
/// Async handlers run on the runtime; blocking handlers run on the blocking
/// thread pool so CPU heavy work never stalls the scheduler.
#[derive(Clone)]
pub enum TaskHandler {
    Async(Arc<AsyncFn>),
    Blocking(Arc<BlockingFn>),
}

impl TaskHandler {
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        TaskHandler::Async(Arc::new(move |payload| Box::pin(f(payload))))
    }

    pub fn from_blocking<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        TaskHandler::Blocking(Arc::new(f))
    }
}

impl fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskHandler::Async(_) => f.write_str("TaskHandler::Async"),
            TaskHandler::Blocking(_) => f.write_str("TaskHandler::Blocking"),
        }
    }
}

/// Invoked once a task reaches `Completed` or `Failed`
pub type TaskCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// Work submitted by a caller
///
/// Unset limits fall back to the processor defaults.
#[derive(Clone)]
pub struct TaskSpec {
    pub kind: String,
    pub payload: Value,
    pub priority: TaskPriority,
    pub pool: String,
    pub owner_instance: Option<String>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    /// Bytes of available memory required to accept the task
    pub memory_limit: Option<u64>,
    pub handler: TaskHandler,
    pub callback: Option<TaskCallback>,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>, handler: TaskHandler) -> Self {
        Self {
            kind: kind.into(),
            payload: Value::Null,
            priority: TaskPriority::Normal,
            pool: "default".to_string(),
            owner_instance: None,
            max_retries: None,
            timeout: None,
            memory_limit: None,
            handler,
            callback: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn with_owner(mut self, instance: impl Into<String>) -> Self {
        self.owner_instance = Some(instance.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("pool", &self.pool)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a task as tracked by the processor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub owner_instance: String,
    pub kind: String,
    pub pool: String,
    pub priority: TaskPriority,
    pub payload: Value,
    pub max_retries: u32,
    pub timeout: Duration,
    pub memory_limit: u64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Times the handler was started
    pub attempts: u32,
    pub execution_time: Option<Duration>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    /// Worker of the current or last attempt
    pub worker: Option<String>,
}

impl Task {
    /// Move to `next` when the edge is legal
    pub(crate) fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::error!(
                "illegal task transition {:?} -> {:?} for {}",
                self.status,
                next,
                self.id
            );
            return false;
        }
        self.status = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_and_lowering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::Critical.lower(), TaskPriority::High);
        assert_eq!(TaskPriority::Low.lower(), TaskPriority::Low);
    }

    #[test]
    fn test_terminal_states_never_leave() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for from in [TaskStatus::Completed, TaskStatus::Cancelled, TaskStatus::Failed] {
            for to in all {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_handlers_run() {
        let handler = TaskHandler::from_async(|payload| async move { Ok(payload) });
        let TaskHandler::Async(f) = handler else {
            panic!("expected async handler");
        };
        assert_eq!(f(Value::from(3)).await, Ok(Value::from(3)));

        let handler = TaskHandler::from_blocking(|_| Err("boom".to_string()));
        let TaskHandler::Blocking(f) = handler else {
            panic!("expected blocking handler");
        };
        assert_eq!(f(Value::Null), Err("boom".to_string()));
    }
}
