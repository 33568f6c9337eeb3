use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{ExceptionCode, RegisterKind, Request, Response};
use crate::errors::UmdtError;
use crate::events::{EventBus, EventKind};

/// Scalar-typed entries of a script's private state map.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

/// Register access handed to server-side scripts.
#[async_trait]
pub trait RegisterAccess: Send + Sync {
    async fn read_register(
        &self,
        unit_id: u8,
        address: u16,
        kind: RegisterKind,
    ) -> Result<u16, UmdtError>;

    async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
        kind: RegisterKind,
    ) -> Result<(), UmdtError>;
}

/// The capability surface handed to every hook.
///
/// Scripts talk to the world only through this object: their own state map,
/// structured logging, cooperative sleeps, managed background tasks, the
/// register store (server side) and the event bus.
pub struct ScriptCtx {
    script_name: String,
    /// Per-script mutable state; survives across hook invocations.
    pub state: HashMap<String, ScalarValue>,
    events: EventBus,
    registers: Option<Arc<dyn RegisterAccess>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ScriptCtx {
    pub(crate) fn new(
        script_name: impl Into<String>,
        events: EventBus,
        registers: Option<Arc<dyn RegisterAccess>>,
    ) -> Self {
        Self {
            script_name: script_name.into(),
            state: HashMap::new(),
            events,
            registers,
            tasks: Vec::new(),
        }
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn log_debug(&self, message: &str) {
        debug!(script = %self.script_name, "{}", message);
    }

    pub fn log_info(&self, message: &str) {
        info!(script = %self.script_name, "{}", message);
    }

    pub fn log_warning(&self, message: &str) {
        warn!(script = %self.script_name, "{}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(script = %self.script_name, "{}", message);
    }

    /// Cooperative suspension; never blocks the engine thread.
    pub async fn sleep(&self, seconds: f64) {
        tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
    }

    /// Spawns a managed background task, cancelled when the script stops.
    pub fn schedule_task<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task));
    }

    /// Reads one register from the hosting server's store. Server side only.
    pub async fn read_register(
        &self,
        unit_id: u8,
        address: u16,
        kind: RegisterKind,
    ) -> Result<u16, UmdtError> {
        match &self.registers {
            Some(registers) => registers.read_register(unit_id, address, kind).await,
            None => Err(UmdtError::invalid_argument(
                "register access is only available to server scripts",
            )),
        }
    }

    /// Writes one register in the hosting server's store. Server side only.
    pub async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
        kind: RegisterKind,
    ) -> Result<(), UmdtError> {
        match &self.registers {
            Some(registers) => {
                registers
                    .write_register(unit_id, address, value, kind)
                    .await
            }
            None => Err(UmdtError::invalid_argument(
                "register access is only available to server scripts",
            )),
        }
    }

    /// Builds the exception response matching `request`.
    pub fn make_response_exception(&self, request: &Request, code: ExceptionCode) -> Response {
        Response::exception_for(request, code)
    }

    /// Publishes a custom event on the diagnostic bus.
    pub fn emit_event(&self, name: impl Into<String>, payload: serde_json::Value) {
        self.events.publish(EventKind::Custom {
            name: name.into(),
            payload,
        });
    }

    /// Cancels every task the script scheduled.
    pub(crate) fn cancel_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ScriptCtx {
    fn drop(&mut self) {
        self.cancel_tasks();
    }
}
