//! Action dispatcher: routes a task's `action` key to its handler.
//!
//! Every dispatch, in order:
//! 1. screens the action key against the denylist
//! 2. looks the handler up (`Unsupported` when absent)
//! 3. screens parameters for handlers that spawn processes
//! 4. runs the handler in a fresh working directory under a timeout
//!
//! Steps 1-3 are also run at submission through [`ActionDispatcher::screen`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::actions::builtin::{
    AnalysisCallbackHandler, FileOperationHandler, HttpRequestHandler, ScriptExecutionHandler,
    ShellCommandHandler,
};
use crate::actions::handler::{ActionContext, ActionHandler, ActionOutput};
use crate::actions::safety::CommandFilter;
use crate::config::EngineConfig;
use crate::error::{ActionError, ConfigError};

/// Registry of action handlers plus the checks wrapped around every call.
pub struct ActionDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    filter: CommandFilter,
    default_timeout: Duration,
    timeouts: HashMap<String, Duration>,
    workdir_root: PathBuf,
    analysis: Option<Arc<AnalysisCallbackHandler>>,
}

impl ActionDispatcher {
    /// Dispatcher with no handlers registered.
    pub fn new(config: &EngineConfig) -> Result<Self, ConfigError> {
        Self::with_handlers(config, HashMap::new(), None)
    }

    /// Dispatcher with the five built-in actions registered.
    pub fn with_builtins(config: &EngineConfig) -> Result<Self, ConfigError> {
        let analysis = Arc::new(AnalysisCallbackHandler::new());
        let builtins: [Arc<dyn ActionHandler>; 5] = [
            Arc::new(ShellCommandHandler::new()),
            Arc::new(ScriptExecutionHandler::new()),
            Arc::new(HttpRequestHandler::new()),
            Arc::new(FileOperationHandler::new(config.file_root.clone())),
            analysis.clone(),
        ];
        let handlers = builtins
            .into_iter()
            .map(|h| (h.action().to_string(), h))
            .collect();
        Self::with_handlers(config, handlers, Some(analysis))
    }

    fn with_handlers(
        config: &EngineConfig,
        handlers: HashMap<String, Arc<dyn ActionHandler>>,
        analysis: Option<Arc<AnalysisCallbackHandler>>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            handlers: RwLock::new(handlers),
            filter: CommandFilter::new(&config.denylist)?,
            default_timeout: config.default_action_timeout,
            timeouts: config.action_timeouts.clone(),
            workdir_root: config.workdir_root.clone(),
            analysis,
        })
    }

    /// Register a handler, replacing any previous one for the same action.
    pub async fn register(&self, handler: Arc<dyn ActionHandler>) {
        let action = handler.action().to_string();
        self.handlers.write().await.insert(action.clone(), handler);
        debug!("Registered action handler: {}", action);
    }

    pub async fn unregister(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.write().await.remove(action)
    }

    pub async fn get(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.read().await.get(action).cloned()
    }

    pub async fn has(&self, action: &str) -> bool {
        self.handlers.read().await.contains_key(action)
    }

    /// Registered action keys, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        actions.sort();
        actions
    }

    /// The built-in `analysis_callback` registry, when the built-ins are installed.
    pub fn analysis(&self) -> Option<&Arc<AnalysisCallbackHandler>> {
        self.analysis.as_ref()
    }

    pub fn filter(&self) -> &CommandFilter {
        &self.filter
    }

    pub fn timeout_for(&self, action: &str) -> Duration {
        self.timeouts
            .get(action)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Denylist and handler checks, without running anything.
    pub async fn screen(
        &self,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<Arc<dyn ActionHandler>, ActionError> {
        self.filter.check(action)?;

        let handler = self
            .get(action)
            .await
            .ok_or_else(|| ActionError::Unsupported {
                action: action.to_string(),
            })?;

        if handler.requires_screening() {
            for (key, value) in params {
                self.filter.check(key)?;
                self.filter.check_value(value)?;
            }
        }
        Ok(handler)
    }

    /// Run `action` with `params`. `ctx.workdir` is replaced by a fresh directory.
    pub async fn dispatch(
        &self,
        action: &str,
        params: &Map<String, Value>,
        mut ctx: ActionContext,
    ) -> Result<ActionOutput, ActionError> {
        let handler = self.screen(action, params).await?;

        tokio::fs::create_dir_all(&self.workdir_root)
            .await
            .map_err(|e| {
                ActionError::transient(action, format!("Failed to create working root: {e}"))
            })?;
        let root = self.workdir_root.clone();
        let prefix = format!("task-{}-", ctx.task_id);
        let workdir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix(&prefix).tempdir_in(root)
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|created| created)
        .map_err(|e| {
            ActionError::transient(action, format!("Failed to create working directory: {e}"))
        })?;
        ctx.workdir = workdir.path().to_path_buf();

        let timeout = self.timeout_for(action);
        debug!(task_id = %ctx.task_id, action, workdir = %ctx.workdir.display(), "Dispatching");

        // Dropping the handler future on timeout kills any child process it owns.
        let outcome = match tokio::time::timeout(timeout, handler.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout {
                action: action.to_string(),
                timeout,
            }),
        };

        // Recursive removal blocks; keep it off the runtime threads.
        match tokio::task::spawn_blocking(move || workdir.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Failed to remove working directory"),
            Err(e) => debug!(error = %e, "Working directory cleanup did not finish"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    struct SleepyHandler;

    #[async_trait]
    impl ActionHandler for SleepyHandler {
        fn action(&self) -> &str {
            "sleepy"
        }

        async fn execute(
            &self,
            _params: &Map<String, Value>,
            _ctx: ActionContext,
        ) -> Result<ActionOutput, ActionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ActionOutput::default())
        }
    }

    struct WorkdirHandler;

    #[async_trait]
    impl ActionHandler for WorkdirHandler {
        fn action(&self) -> &str {
            "workdir"
        }

        async fn execute(
            &self,
            _params: &Map<String, Value>,
            ctx: ActionContext,
        ) -> Result<ActionOutput, ActionError> {
            Ok(ActionOutput::new(json!({
                "workdir": ctx.workdir,
                "exists": ctx.workdir.is_dir(),
            })))
        }
    }

    fn config(root: &std::path::Path) -> EngineConfig {
        EngineConfig {
            workdir_root: root.to_path_buf(),
            file_root: root.join("files"),
            ..EngineConfig::default()
        }
    }

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn ctx() -> ActionContext {
        ActionContext::detached(Uuid::new_v4(), PathBuf::new())
    }

    #[tokio::test]
    async fn builtins_are_registered() {
        let dir = tempfile::tempdir().unwrap();
        let d = ActionDispatcher::with_builtins(&config(dir.path())).unwrap();
        assert_eq!(
            d.list().await,
            vec![
                "analysis_callback",
                "file_operation",
                "http_request",
                "script_execution",
                "shell_command",
            ]
        );
    }

    #[tokio::test]
    async fn unknown_action_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let d = ActionDispatcher::with_builtins(&config(dir.path())).unwrap();
        let err = d.dispatch("teleport", &Map::new(), ctx()).await.unwrap_err();
        assert!(matches!(err, ActionError::Unsupported { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn analysis_registry_only_with_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let bare = ActionDispatcher::new(&config(dir.path())).unwrap();
        assert!(bare.analysis().is_none());
        assert!(!bare.has("analysis_callback").await);

        let full = ActionDispatcher::with_builtins(&config(dir.path())).unwrap();
        assert!(full.analysis().is_some());
        assert!(full.has("analysis_callback").await);
    }

    #[tokio::test]
    async fn screen_rejects_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let d = ActionDispatcher::with_builtins(&config(dir.path())).unwrap();
        let err = d.screen("teleport", &Map::new()).await.err().unwrap();
        assert!(matches!(err, ActionError::Unsupported { .. }));
        let err = d
            .screen("shell_command", &params(json!({"command": "rm -rf '/'"})))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ActionError::SecurityViolation { .. }));
        assert!(d
            .screen("shell_command", &params(json!({"command": "echo ok"})))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn denylisted_action_key_is_violation() {
        let dir = tempfile::tempdir().unwrap();
        let d = ActionDispatcher::with_builtins(&config(dir.path())).unwrap();
        let err = d.dispatch("rm -rf /", &Map::new(), ctx()).await.unwrap_err();
        assert!(matches!(err, ActionError::SecurityViolation { .. }));
    }

    #[tokio::test]
    async fn shell_parameters_are_screened() {
        let dir = tempfile::tempdir().unwrap();
        let d = ActionDispatcher::with_builtins(&config(dir.path())).unwrap();
        let err = d
            .dispatch("shell_command", &params(json!({"command": "sudo rm -rf /"})), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::SecurityViolation { .. }));
    }

    #[tokio::test]
    async fn each_dispatch_gets_a_fresh_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let d = ActionDispatcher::new(&config(dir.path())).unwrap();
        d.register(Arc::new(WorkdirHandler)).await;

        let first = d.dispatch("workdir", &Map::new(), ctx()).await.unwrap();
        let second = d.dispatch("workdir", &Map::new(), ctx()).await.unwrap();

        assert_eq!(first.result["exists"], true);
        assert_ne!(first.result["workdir"], second.result["workdir"]);
        let path = PathBuf::from(first.result["workdir"].as_str().unwrap());
        assert!(path.starts_with(dir.path()));
        assert!(!path.exists(), "workdir is removed after the handler returns");
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.action_timeouts
            .insert("sleepy".to_string(), Duration::from_millis(50));
        let d = ActionDispatcher::new(&cfg).unwrap();
        d.register(Arc::new(SleepyHandler)).await;

        let err = d.dispatch("sleepy", &Map::new(), ctx()).await.unwrap_err();
        assert!(matches!(err, ActionError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn shell_echo_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let d = ActionDispatcher::with_builtins(&config(dir.path())).unwrap();
        let out = d
            .dispatch("shell_command", &params(json!({"command": "echo hi"})), ctx())
            .await
            .unwrap();
        assert_eq!(out.result["stdout"].as_str().unwrap().trim(), "hi");
    }
}
