use thiserror::Error;

/// A failure raised inside a user hook.
///
/// Script errors never escalate: the pipeline logs them, emits them on the
/// event bus and continues with the request/response unchanged.
#[derive(Error, Debug, Clone)]
#[error("Script error in {script}: {message}")]
pub struct ScriptError {
    pub script: String,
    pub message: String,
}

impl ScriptError {
    pub fn new(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            message: message.into(),
        }
    }
}
