//! `shell_command`: run a command line through `sh -c`.
//!
//! Parameters:
//! - `command` (string, required)
//! - `env` (object of strings, optional): extra environment variables

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::actions::builtin::process::run_process;
use crate::actions::handler::{ActionContext, ActionHandler, ActionOutput, require_str};
use crate::error::ActionError;

pub const ACTION: &str = "shell_command";

/// Shell command execution handler.
#[derive(Debug, Default)]
pub struct ShellCommandHandler;

impl ShellCommandHandler {
    pub fn new() -> Self {
        Self
    }
}

/// Collect `env` as key/value pairs; every value must be a string.
pub(crate) fn env_pairs(
    action: &str,
    params: &Map<String, Value>,
) -> Result<Vec<(String, String)>, ActionError> {
    let Some(env) = params.get("env") else {
        return Ok(Vec::new());
    };
    let obj = env.as_object().ok_or_else(|| ActionError::InvalidParameters {
        action: action.to_string(),
        reason: "`env` must be an object".to_string(),
    })?;

    obj.iter()
        .map(|(k, v)| {
            v.as_str()
                .map(|s| (k.clone(), s.to_string()))
                .ok_or_else(|| ActionError::InvalidParameters {
                    action: action.to_string(),
                    reason: format!("env value for `{k}` must be a string"),
                })
        })
        .collect()
}

#[async_trait]
impl ActionHandler for ShellCommandHandler {
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
        let cmd = require_str(ACTION, params, "command")?;

        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", cmd]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", cmd]);
            c
        };
        command
            .current_dir(&ctx.workdir)
            .envs(env_pairs(ACTION, params)?)
            .env("WORK_ENGINE_TASK_ID", ctx.task_id.to_string());

        let output = run_process(ACTION, command, &ctx.cancel).await?;
        ctx.progress.report(100);
        Ok(ActionOutput::new(output.into_result(ACTION)?))
    }
}
