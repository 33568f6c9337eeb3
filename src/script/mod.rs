//! Hosting for user-supplied hooks.
//!
//! Scripts are compiled trait objects registered by name; a config file's
//! `scripts:` entries select them at start. Hooks run cooperatively, one at
//! a time per engine, and a failing hook degrades to pass-through — a buggy
//! script can never halt the pipeline it is attached to.

mod context;
mod hooks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::warn;

pub use context::{RegisterAccess, ScalarValue, ScriptCtx};
pub use hooks::{BridgeScript, HookOutcome, HookResult, ServerScript};

use crate::codec::{ExceptionCode, Request, Response};
use crate::errors::ScriptError;
use crate::events::{EventBus, EventKind};

/// Default grace period for `on_stop` before tasks are cancelled.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Net effect of running a full hook chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome<T> {
    Continue(T),
    Exception(ExceptionCode),
    Drop,
}

fn report_script_error(events: &EventBus, error: &ScriptError) {
    warn!("{}", error);
    events.publish(EventKind::Error {
        message: error.to_string(),
        raw: None,
    });
}

/// Folds one hook result into the chain, downgrading script errors.
fn fold<T>(
    current: T,
    result: HookResult<T>,
    events: &EventBus,
) -> Result<T, ChainOutcome<T>> {
    match result {
        Ok(HookOutcome::Pass) => Ok(current),
        Ok(HookOutcome::Replace(next)) => Ok(next),
        Ok(HookOutcome::Exception(code)) => Err(ChainOutcome::Exception(code)),
        Ok(HookOutcome::Drop) => Err(ChainOutcome::Drop),
        Err(error) => {
            report_script_error(events, &error);
            Ok(current)
        }
    }
}

struct Slot<S: ?Sized> {
    script: Arc<S>,
    ctx: Mutex<ScriptCtx>,
}

/// Shared mechanics of both hosts: an atomically swappable slot table.
struct HostCore<S: ?Sized> {
    events: EventBus,
    registers: Option<Arc<dyn RegisterAccess>>,
    slots: RwLock<Arc<Vec<Arc<Slot<S>>>>>,
}

impl<S: ?Sized> HostCore<S> {
    fn new(events: EventBus, registers: Option<Arc<dyn RegisterAccess>>) -> Self {
        Self {
            events,
            registers,
            slots: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Snapshot of the current table; requests in flight keep the table
    /// they started with even across a reload.
    async fn snapshot(&self) -> Arc<Vec<Arc<Slot<S>>>> {
        Arc::clone(&*self.slots.read().await)
    }

    async fn install(&self, scripts: Vec<Arc<S>>, names: Vec<String>) {
        let slots: Vec<Arc<Slot<S>>> = scripts
            .into_iter()
            .zip(names)
            .map(|(script, name)| {
                Arc::new(Slot {
                    script,
                    ctx: Mutex::new(ScriptCtx::new(
                        name,
                        self.events.clone(),
                        self.registers.clone(),
                    )),
                })
            })
            .collect();
        *self.slots.write().await = Arc::new(slots);
    }
}

/// Host for mock-server scripts.
pub struct ServerScriptHost {
    core: HostCore<dyn ServerScript>,
}

impl ServerScriptHost {
    pub fn new(events: EventBus, registers: Option<Arc<dyn RegisterAccess>>) -> Self {
        Self {
            core: HostCore::new(events, registers),
        }
    }

    /// Atomically replaces the hook table. Safe to call while serving; the
    /// next request sees the new table.
    pub async fn install(&self, scripts: Vec<Arc<dyn ServerScript>>) {
        let names = scripts.iter().map(|s| s.name().to_string()).collect();
        self.core.install(scripts, names).await;
    }

    pub async fn is_empty(&self) -> bool {
        self.core.snapshot().await.is_empty()
    }

    pub async fn start(&self) {
        for slot in self.core.snapshot().await.iter() {
            let mut ctx = slot.ctx.lock().await;
            if let Err(error) = slot.script.on_start(&mut ctx).await {
                report_script_error(&self.core.events, &error);
            }
        }
    }

    /// Runs `on_stop` with a bounded grace period, then cancels the
    /// scripts' background tasks.
    pub async fn stop(&self, grace: Duration) {
        for slot in self.core.snapshot().await.iter() {
            let mut ctx = slot.ctx.lock().await;
            if tokio::time::timeout(grace, slot.script.on_stop(&mut ctx))
                .await
                .is_err()
            {
                warn!("Script {} exceeded the stop grace period", ctx.script_name());
            }
            ctx.cancel_tasks();
        }
    }

    pub async fn run_periodic(&self) {
        for slot in self.core.snapshot().await.iter() {
            let mut ctx = slot.ctx.lock().await;
            if let Err(error) = slot.script.on_periodic(&mut ctx).await {
                report_script_error(&self.core.events, &error);
            }
        }
    }

    pub async fn run_request(&self, mut request: Request) -> ChainOutcome<Request> {
        for slot in self.core.snapshot().await.iter() {
            let mut ctx = slot.ctx.lock().await;
            let result = slot.script.on_request(&request, &mut ctx).await;
            match fold(request, result, &self.core.events) {
                Ok(next) => request = next,
                Err(outcome) => return outcome,
            }
        }
        ChainOutcome::Continue(request)
    }

    pub async fn run_response(
        &self,
        request: &Request,
        mut response: Response,
    ) -> ChainOutcome<Response> {
        for slot in self.core.snapshot().await.iter() {
            let mut ctx = slot.ctx.lock().await;
            let result = slot.script.on_response(request, &response, &mut ctx).await;
            match fold(response, result, &self.core.events) {
                Ok(next) => response = next,
                Err(outcome) => return outcome,
            }
        }
        ChainOutcome::Continue(response)
    }

    pub async fn run_write(&self, unit_id: u8, address: u16, value: u16) {
        for slot in self.core.snapshot().await.iter() {
            let mut ctx = slot.ctx.lock().await;
            if let Err(error) = slot
                .script
                .on_write(unit_id, address, value, &mut ctx)
                .await
            {
                report_script_error(&self.core.events, &error);
            }
        }
    }
}

/// Host for bridge scripts.
pub struct BridgeScriptHost {
    core: HostCore<dyn BridgeScript>,
}

macro_rules! bridge_chain {
    ($name:ident, $hook:ident, $ty:ty) => {
        pub async fn $name(&self, mut value: $ty) -> ChainOutcome<$ty> {
            for slot in self.core.snapshot().await.iter() {
                let mut ctx = slot.ctx.lock().await;
                let result = slot.script.$hook(&value, &mut ctx).await;
                match fold(value, result, &self.core.events) {
                    Ok(next) => value = next,
                    Err(outcome) => return outcome,
                }
            }
            ChainOutcome::Continue(value)
        }
    };
}

impl BridgeScriptHost {
    pub fn new(events: EventBus) -> Self {
        Self {
            core: HostCore::new(events, None),
        }
    }

    pub async fn install(&self, scripts: Vec<Arc<dyn BridgeScript>>) {
        let names = scripts.iter().map(|s| s.name().to_string()).collect();
        self.core.install(scripts, names).await;
    }

    pub async fn is_empty(&self) -> bool {
        self.core.snapshot().await.is_empty()
    }

    pub async fn start(&self) {
        for slot in self.core.snapshot().await.iter() {
            let mut ctx = slot.ctx.lock().await;
            if let Err(error) = slot.script.on_start(&mut ctx).await {
                report_script_error(&self.core.events, &error);
            }
        }
    }

    pub async fn stop(&self, grace: Duration) {
        for slot in self.core.snapshot().await.iter() {
            let mut ctx = slot.ctx.lock().await;
            if tokio::time::timeout(grace, slot.script.on_stop(&mut ctx))
                .await
                .is_err()
            {
                warn!("Script {} exceeded the stop grace period", ctx.script_name());
            }
            ctx.cancel_tasks();
        }
    }

    pub async fn run_periodic(&self) {
        for slot in self.core.snapshot().await.iter() {
            let mut ctx = slot.ctx.lock().await;
            if let Err(error) = slot.script.on_periodic(&mut ctx).await {
                report_script_error(&self.core.events, &error);
            }
        }
    }

    bridge_chain!(run_ingress, ingress, Request);
    bridge_chain!(run_egress, egress, Request);
    bridge_chain!(run_response, response, Response);
    bridge_chain!(run_upstream_response, upstream_response, Response);
}

type ServerFactory = Box<dyn Fn() -> Arc<dyn ServerScript> + Send + Sync>;
type BridgeFactory = Box<dyn Fn() -> Arc<dyn BridgeScript> + Send + Sync>;

/// Named script factories, resolved by config `scripts:` entries.
#[derive(Default)]
pub struct ScriptRegistry {
    server: HashMap<String, ServerFactory>,
    bridge: HashMap<String, BridgeFactory>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_server<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn ServerScript> + Send + Sync + 'static,
    {
        self.server.insert(name.into(), Box::new(factory));
    }

    pub fn register_bridge<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn BridgeScript> + Send + Sync + 'static,
    {
        self.bridge.insert(name.into(), Box::new(factory));
    }

    pub fn build_server(&self, name: &str) -> Option<Arc<dyn ServerScript>> {
        self.server.get(name).map(|factory| factory())
    }

    pub fn build_bridge(&self, name: &str) -> Option<Arc<dyn BridgeScript>> {
        self.bridge.get(name).map(|factory| factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct RemapScript;

    #[async_trait]
    impl BridgeScript for RemapScript {
        fn name(&self) -> &str {
            "remap"
        }

        async fn ingress(&self, request: &Request, _ctx: &mut ScriptCtx) -> HookResult<Request> {
            if request.function == 0x03 {
                let mut remapped = request.clone();
                remapped.address -= 1000;
                return Ok(HookOutcome::Replace(remapped));
            }
            Ok(HookOutcome::Pass)
        }
    }

    struct FailingScript;

    #[async_trait]
    impl ServerScript for FailingScript {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_request(&self, _: &Request, _: &mut ScriptCtx) -> HookResult<Request> {
            Err(ScriptError::new("failing", "deliberate failure"))
        }
    }

    struct BlockScript;

    #[async_trait]
    impl ServerScript for BlockScript {
        fn name(&self) -> &str {
            "block"
        }

        async fn on_request(&self, request: &Request, _: &mut ScriptCtx) -> HookResult<Request> {
            if request.address >= 1000 {
                return Ok(HookOutcome::Exception(ExceptionCode::IllegalDataAddress));
            }
            Ok(HookOutcome::Pass)
        }
    }

    fn request(function: u8, address: u16) -> Request {
        let mut payload = address.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0x00, 0x01]);
        Request::parse(1, function, &payload)
    }

    #[tokio::test]
    async fn test_bridge_ingress_remap() {
        let host = BridgeScriptHost::new(EventBus::default());
        host.install(vec![Arc::new(RemapScript)]).await;

        match host.run_ingress(request(0x03, 41_000)).await {
            ChainOutcome::Continue(req) => assert_eq!(req.address, 40_000),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Other function codes pass untouched.
        match host.run_ingress(request(0x06, 41_000)).await {
            ChainOutcome::Continue(req) => assert_eq!(req.address, 41_000),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_script_degrades_to_pass() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        let host = ServerScriptHost::new(bus, None);
        host.install(vec![Arc::new(FailingScript)]).await;

        let outcome = host.run_request(request(0x03, 5)).await;
        match outcome {
            ChainOutcome::Continue(req) => assert_eq!(req.address, 5),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let event = sub.recv().await.unwrap();
        match event.kind {
            EventKind::Error { message, .. } => assert!(message.contains("deliberate failure")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exception_short_circuits() {
        let host = ServerScriptHost::new(EventBus::default(), None);
        host.install(vec![Arc::new(BlockScript)]).await;

        assert_eq!(
            host.run_request(request(0x03, 2000)).await,
            ChainOutcome::Exception(ExceptionCode::IllegalDataAddress)
        );
    }

    #[tokio::test]
    async fn test_hot_reload_swaps_table() {
        let host = ServerScriptHost::new(EventBus::default(), None);
        assert!(host.is_empty().await);

        host.install(vec![Arc::new(BlockScript)]).await;
        assert!(!host.is_empty().await);
        assert_eq!(
            host.run_request(request(0x03, 2000)).await,
            ChainOutcome::Exception(ExceptionCode::IllegalDataAddress)
        );

        // Reload with an empty table: requests pass again.
        host.install(Vec::new()).await;
        match host.run_request(request(0x03, 2000)).await {
            ChainOutcome::Continue(_) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = ScriptRegistry::new();
        registry.register_bridge("remap", || Arc::new(RemapScript));

        assert!(registry.build_bridge("remap").is_some());
        assert!(registry.build_bridge("missing").is_none());
        assert!(registry.build_server("remap").is_none());
    }
}
