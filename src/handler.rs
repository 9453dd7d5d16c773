//! Task handlers and the registry that dispatches to them
//!
//! Handlers are registered once at startup, before the engine runs. Several
//! handlers may listen to the same task type; they run in registration order.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{TaskError, TaskResult};
use crate::task::TaskData;

pub type HandlerResult = anyhow::Result<()>;

/// Business logic invoked with a task's named arguments
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// `data` is `None` when the task carries no arguments
    async fn handle(&self, data: Option<&TaskData>) -> HandlerResult;
}

/// Build a handler's argument struct from the task data; no data decodes
/// from an empty object so argument structs with defaults still work.
fn decode_args<T: DeserializeOwned>(data: Option<&TaskData>) -> anyhow::Result<T> {
    let object = Value::Object(data.cloned().unwrap_or_default());
    serde_json::from_value(object).context("task data does not match handler arguments")
}

struct FnHandler<F, T, Fut> {
    f: F,
    _marker: PhantomData<fn(T) -> Fut>,
}

#[async_trait]
impl<F, T, Fut> TaskHandler for FnHandler<F, T, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, data: Option<&TaskData>) -> HandlerResult {
        let args = decode_args::<T>(data)?;
        (self.f)(args).await
    }
}

struct BlockingHandler<F, T> {
    f: Arc<F>,
    _marker: PhantomData<fn(T)>,
}

#[async_trait]
impl<F, T> TaskHandler for BlockingHandler<F, T>
where
    F: Fn(T) -> HandlerResult + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
{
    async fn handle(&self, data: Option<&TaskData>) -> HandlerResult {
        let args = decode_args::<T>(data)?;
        let f = self.f.clone();
        tokio::task::spawn_blocking(move || f(args))
            .await
            .map_err(|e| anyhow!("blocking handler did not finish: {}", e))?
    }
}

/// What to do with the remaining handlers once one fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abort the dispatch; later handlers for the task are not invoked
    #[default]
    StopOnFirstFailure,
    /// Run every handler regardless
    ContinueOnFailure,
}

#[derive(Debug)]
pub struct HandlerFailure {
    /// Position of the handler in registration order
    pub index: usize,
    pub error: anyhow::Error,
}

/// Per-handler outcome of one dispatch
#[derive(Debug)]
pub struct DispatchReport {
    pub task_type: String,
    /// Handlers registered for the type
    pub handlers: usize,
    pub succeeded: usize,
    pub failures: Vec<HandlerFailure>,
    /// Handlers not invoked because an earlier one failed
    pub skipped: usize,
}

impl DispatchReport {
    fn new(task_type: &str, handlers: usize) -> Self {
        Self {
            task_type: task_type.to_string(),
            handlers,
            succeeded: 0,
            failures: Vec::new(),
            skipped: 0,
        }
    }

    /// No handler was registered, the task was dropped
    pub fn was_dropped(&self) -> bool {
        self.handlers == 0
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse into the first failure, if any
    pub fn into_result(self) -> TaskResult<usize> {
        match self.failures.into_iter().next() {
            None => Ok(self.succeeded),
            Some(failure) => Err(TaskError::handler(
                self.task_type,
                format!("handler #{}: {:#}", failure.index, failure.error),
            )),
        }
    }
}

/// Task type -> ordered handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn TaskHandler>>>,
    policy: FailurePolicy,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: FailurePolicy) -> Self {
        Self {
            handlers: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Append a handler for `task_type`
    pub fn register<H>(&mut self, task_type: &str, handler: H) -> &mut Self
    where
        H: TaskHandler + 'static,
    {
        self.handlers
            .entry(task_type.to_string())
            .or_default()
            .push(Arc::new(handler));

        info!("Registered handler for {}", task_type);
        self
    }

    /// Register an async closure taking its arguments as a deserializable struct
    pub fn register_fn<F, T, Fut>(&mut self, task_type: &str, f: F) -> &mut Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(
            task_type,
            FnHandler {
                f,
                _marker: PhantomData,
            },
        )
    }

    /// Register a synchronous closure that is run on the blocking thread pool
    pub fn register_blocking<F, T>(&mut self, task_type: &str, f: F) -> &mut Self
    where
        F: Fn(T) -> HandlerResult + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        self.register(
            task_type,
            BlockingHandler {
                f: Arc::new(f),
                _marker: PhantomData,
            },
        )
    }

    pub fn handler_count(&self, task_type: &str) -> usize {
        self.handlers.get(task_type).map_or(0, Vec::len)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Total number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handlers registered for `task_type`.
    ///
    /// A task type nobody listens to is logged and dropped. A failing handler
    /// is logged; under [`FailurePolicy::StopOnFirstFailure`] the remaining
    /// handlers are skipped.
    pub async fn dispatch(&self, task_type: &str, data: &TaskData) -> DispatchReport {
        let Some(handlers) = self.handlers.get(task_type) else {
            warn!("Handler not found for task_type: {}", task_type);
            return DispatchReport::new(task_type, 0);
        };

        let args = if data.is_empty() {
            debug!("No data found in work message: {}", task_type);
            None
        } else {
            Some(data)
        };

        let mut report = DispatchReport::new(task_type, handlers.len());
        for (index, handler) in handlers.iter().enumerate() {
            match handler.handle(args).await {
                Ok(()) => report.succeeded += 1,
                Err(error) => {
                    error!("Handler #{} for {} failed: {:#}", index, task_type, error);
                    report.failures.push(HandlerFailure { index, error });

                    if self.policy == FailurePolicy::StopOnFirstFailure {
                        report.skipped = handlers.len() - index - 1;
                        break;
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn data(value: Value) -> TaskData {
        value.as_object().cloned().unwrap_or_default()
    }

    #[derive(Deserialize)]
    struct Greeting {
        name: String,
        #[serde(default)]
        excited: bool,
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        for label in ["first", "second", "third"] {
            let calls = calls.clone();
            registry.register_fn("T", move |_: TaskData| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(label);
                    Ok(())
                }
            });
        }

        let report = registry.dispatch("T", &TaskData::new()).await;

        assert_eq!(report.succeeded, 3);
        assert!(report.is_success());
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(registry.handler_count("T"), 3);
    }

    #[tokio::test]
    async fn arguments_are_unpacked_by_name() {
        let seen = Arc::new(Mutex::new(None));
        let mut registry = HandlerRegistry::new();
        {
            let seen = seen.clone();
            registry.register_fn("greet", move |args: Greeting| {
                let seen = seen.clone();
                async move {
                    *seen.lock().unwrap() = Some((args.name, args.excited));
                    Ok(())
                }
            });
        }

        registry.dispatch("greet", &data(json!({"name": "ada"}))).await;
        assert_eq!(*seen.lock().unwrap(), Some(("ada".to_string(), false)));
    }

    #[tokio::test]
    async fn missing_arguments_fail_the_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("greet", |_: Greeting| async { Ok(()) });

        let report = registry.dispatch("greet", &TaskData::new()).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.succeeded, 0);
    }

    #[tokio::test]
    async fn unknown_type_is_dropped() {
        let registry = HandlerRegistry::new();
        let report = registry.dispatch("nobody_listens", &data(json!({"a": 1}))).await;

        assert!(report.was_dropped());
        assert!(report.is_success());
        assert_eq!(report.succeeded, 0);
    }

    #[tokio::test]
    async fn failure_stops_remaining_handlers() {
        let second_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register_fn("T", |_: TaskData| async { Err(anyhow!("boom")) });
        {
            let second_calls = second_calls.clone();
            registry.register_fn("T", move |_: TaskData| {
                let second_calls = second_calls.clone();
                async move {
                    second_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let report = registry.dispatch("T", &TaskData::new()).await;

        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 0);
        assert_eq!(report.skipped, 1);
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn continue_policy_runs_everything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::with_policy(FailurePolicy::ContinueOnFailure);
        registry.register_fn("T", |_: TaskData| async { Err(anyhow!("boom")) });
        {
            let calls = calls.clone();
            registry.register_fn("T", move |_: TaskData| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let report = registry.dispatch("T", &TaskData::new()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 0);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn blocking_handlers_run_off_the_runtime() {
        let mut registry = HandlerRegistry::new();
        registry.register_blocking("sum", |args: TaskData| {
            let total: i64 = args.values().filter_map(Value::as_i64).sum();
            if total == 6 {
                Ok(())
            } else {
                Err(anyhow!("unexpected total {}", total))
            }
        });

        let report = registry
            .dispatch("sum", &data(json!({"a": 1, "b": 2, "c": 3})))
            .await;
        assert!(report.is_success());
        assert_eq!(report.succeeded, 1);
    }

    struct Recording(Arc<Mutex<Vec<Option<TaskData>>>>);

    #[async_trait]
    impl TaskHandler for Recording {
        async fn handle(&self, data: Option<&TaskData>) -> HandlerResult {
            self.0.lock().unwrap().push(data.cloned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_data_invokes_without_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("T", Recording(seen.clone()));

        registry.dispatch("T", &TaskData::new()).await;
        registry.dispatch("T", &data(json!({"a": 1}))).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], None);
        assert_eq!(seen[1], Some(data(json!({"a": 1}))));
    }
}
