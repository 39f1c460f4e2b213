//! `analysis_callback`: invoke an in-process callback registered by name.
//!
//! Parameters:
//! - `callback` (string, required): registered callback name
//!
//! Every other parameter, the task context and the dependency results are
//! handed to the callback.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actions::handler::{
    ActionContext, ActionHandler, ActionOutput, ProgressReporter, require_str,
};
use crate::error::ActionError;

pub const ACTION: &str = "analysis_callback";

/// Input handed to an analysis callback.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub task_id: Uuid,
    pub parameters: Map<String, Value>,
    pub context: Map<String, Value>,
    pub dependency_results: Map<String, Value>,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

/// A registered callback.
pub type AnalysisCallback =
    Arc<dyn Fn(AnalysisInput) -> BoxFuture<'static, Result<Value, ActionError>> + Send + Sync>;

/// Registry of named analysis callbacks.
pub struct AnalysisCallbackHandler {
    callbacks: RwLock<HashMap<String, AnalysisCallback>>,
}

impl AnalysisCallbackHandler {
    /// Registry preloaded with `collect_dependencies`.
    pub fn new() -> Self {
        let mut callbacks: HashMap<String, AnalysisCallback> = HashMap::new();
        callbacks.insert(
            "collect_dependencies".to_string(),
            Arc::new(|input: AnalysisInput| -> BoxFuture<'static, Result<Value, ActionError>> {
                Box::pin(async move {
                    Ok(json!({
                        "count": input.dependency_results.len(),
                        "results": input.dependency_results,
                    }))
                })
            }),
        );
        Self {
            callbacks: RwLock::new(callbacks),
        }
    }

    /// Register (or replace) a callback.
    pub async fn register(&self, name: impl Into<String>, callback: AnalysisCallback) {
        let name = name.into();
        tracing::debug!(callback = %name, "Registered analysis callback");
        self.callbacks.write().await.insert(name, callback);
    }

    pub async fn unregister(&self, name: &str) -> Option<AnalysisCallback> {
        self.callbacks.write().await.remove(name)
    }

    pub async fn has(&self, name: &str) -> bool {
        self.callbacks.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callbacks.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AnalysisCallbackHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for AnalysisCallbackHandler {
    fn action(&self) -> &str {
        ACTION
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: ActionContext,
    ) -> Result<ActionOutput, ActionError> {
        let name = require_str(ACTION, params, "callback")?;
        let callback = self
            .callbacks
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ActionError::InvalidParameters {
                action: ACTION.to_string(),
                reason: format!("no analysis callback named `{name}`"),
            })?;

        let mut parameters = params.clone();
        parameters.remove("callback");

        let input = AnalysisInput {
            task_id: ctx.task_id,
            parameters,
            context: ctx.context.clone(),
            dependency_results: ctx.dependency_results.clone(),
            progress: ctx.progress.clone(),
            cancel: ctx.cancel.clone(),
        };

        let result = tokio::select! {
            r = callback(input) => r?,
            _ = ctx.cancel.cancelled() => return Err(ActionError::Cancelled),
        };

        // An object-valued `context` key in the result is merged into the task context.
        let context = result.get("context").and_then(Value::as_object).cloned();
        let mut output = ActionOutput::new(result);
        if let Some(context) = context {
            output = output.with_context(context);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn builtin_collects_dependency_results() {
        let h = AnalysisCallbackHandler::new();
        let mut ctx = ActionContext::detached(Uuid::new_v4(), std::env::temp_dir());
        ctx.dependency_results
            .insert("dep".into(), json!({"stdout": "hi"}));

        let out = h
            .execute(&params(json!({"callback": "collect_dependencies"})), ctx)
            .await
            .unwrap();
        assert_eq!(out.result["count"], 1);
        assert_eq!(out.result["results"]["dep"]["stdout"], "hi");
    }

    #[tokio::test]
    async fn registered_callback_sees_parameters_and_updates_context() {
        let h = AnalysisCallbackHandler::new();
        h.register(
            "double",
            Arc::new(|input: AnalysisInput| -> BoxFuture<'static, Result<Value, ActionError>> {
                Box::pin(async move {
                    let n = input.parameters["n"].as_i64().unwrap_or(0);
                    Ok(json!({ "value": n * 2, "context": { "last": n } }))
                })
            }),
        )
        .await;
        assert!(h.has("double").await);

        let ctx = ActionContext::detached(Uuid::new_v4(), std::env::temp_dir());
        let out = h
            .execute(&params(json!({"callback": "double", "n": 21})), ctx)
            .await
            .unwrap();
        assert_eq!(out.result["value"], 42);
        assert_eq!(out.context.unwrap()["last"], 21);
    }

    #[tokio::test]
    async fn unknown_callback_is_not_retryable() {
        let h = AnalysisCallbackHandler::new();
        let ctx = ActionContext::detached(Uuid::new_v4(), std::env::temp_dir());
        let err = h
            .execute(&params(json!({"callback": "missing"})), ctx)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
