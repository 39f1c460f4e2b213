//! `script_execution`: write a script into the working directory and run it.
//!
//! Parameters:
//! - `script` (string, required): script body
//! - `interpreter` (string, default `sh`)
//! - `args` (array of strings, optional)
//! - `env` (object of strings, optional)

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::actions::builtin::process::run_process;
use crate::actions::builtin::shell::env_pairs;
use crate::actions::handler::{
    ActionContext, ActionHandler, ActionOutput, optional_str, require_str,
};
use crate::error::ActionError;

pub const ACTION: &str = "script_execution";

const SCRIPT_FILE: &str = "script";

#[derive(Debug, Default)]
pub struct ScriptExecutionHandler;

impl ScriptExecutionHandler {
    pub fn new() -> Self {
        Self
    }
}

fn string_args(params: &Map<String, Value>) -> Result<Vec<String>, ActionError> {
    let Some(args) = params.get("args") else {
        return Ok(Vec::new());
    };
    let invalid = || ActionError::InvalidParameters {
        action: ACTION.to_string(),
        reason: "`args` must be an array of strings".to_string(),
    };
    args.as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|a| a.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}

#[async_trait]
impl ActionHandler for ScriptExecutionHandler {
    fn action(&self) -> &str {
        ACTION
    }

    fn requires_screening(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: ActionContext,
    ) -> Result<ActionOutput, ActionError> {
        let script = require_str(ACTION, params, "script")?;
        let interpreter = optional_str(ACTION, params, "interpreter")?.unwrap_or("sh");
        let args = string_args(params)?;

        let path = ctx.workdir.join(SCRIPT_FILE);
        tokio::fs::write(&path, script)
            .await
            .map_err(|e| ActionError::transient(ACTION, format!("Failed to write script: {e}")))?;

        let mut command = Command::new(interpreter);
        command
            .arg(&path)
            .args(&args)
            .current_dir(&ctx.workdir)
            .envs(env_pairs(ACTION, params)?)
            .env("WORK_ENGINE_TASK_ID", ctx.task_id.to_string());

        let output = run_process(ACTION, command, &ctx.cancel).await?;
        ctx.progress.report(100);
        Ok(ActionOutput::new(output.into_result(ACTION)?))
    }
}
