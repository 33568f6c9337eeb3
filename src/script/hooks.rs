use async_trait::async_trait;

use crate::codec::{ExceptionCode, Request, Response};
use crate::errors::ScriptError;

use super::ScriptCtx;

/// What a hook decided to do with the message it saw.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome<T> {
    /// Leave it unchanged.
    Pass,
    /// Substitute a modified message.
    Replace(T),
    /// Short-circuit with an exception response.
    Exception(ExceptionCode),
    /// Swallow the message; no reply is sent.
    Drop,
}

pub type HookResult<T> = Result<HookOutcome<T>, ScriptError>;

/// Hooks a mock-server script may implement.
///
/// Every method defaults to pass-through, so scripts implement only the
/// entry points they care about.
#[async_trait]
pub trait ServerScript: Send + Sync {
    fn name(&self) -> &str;

    async fn on_start(&self, _ctx: &mut ScriptCtx) -> Result<(), ScriptError> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &mut ScriptCtx) -> Result<(), ScriptError> {
        Ok(())
    }

    async fn on_periodic(&self, _ctx: &mut ScriptCtx) -> Result<(), ScriptError> {
        Ok(())
    }

    async fn on_request(&self, _request: &Request, _ctx: &mut ScriptCtx) -> HookResult<Request> {
        Ok(HookOutcome::Pass)
    }

    async fn on_response(
        &self,
        _request: &Request,
        _response: &Response,
        _ctx: &mut ScriptCtx,
    ) -> HookResult<Response> {
        Ok(HookOutcome::Pass)
    }

    /// Observes a committed write.
    async fn on_write(
        &self,
        _unit_id: u8,
        _address: u16,
        _value: u16,
        _ctx: &mut ScriptCtx,
    ) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// Hooks a bridge script may implement, one per pipeline stage.
#[async_trait]
pub trait BridgeScript: Send + Sync {
    fn name(&self) -> &str;

    async fn on_start(&self, _ctx: &mut ScriptCtx) -> Result<(), ScriptError> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &mut ScriptCtx) -> Result<(), ScriptError> {
        Ok(())
    }

    async fn on_periodic(&self, _ctx: &mut ScriptCtx) -> Result<(), ScriptError> {
        Ok(())
    }

    /// First sight of an upstream request.
    async fn ingress(&self, _request: &Request, _ctx: &mut ScriptCtx) -> HookResult<Request> {
        Ok(HookOutcome::Pass)
    }

    /// Last chance before the request goes downstream.
    async fn egress(&self, _request: &Request, _ctx: &mut ScriptCtx) -> HookResult<Request> {
        Ok(HookOutcome::Pass)
    }

    /// Raw downstream reply, before any upstream-facing transformation.
    async fn response(&self, _response: &Response, _ctx: &mut ScriptCtx) -> HookResult<Response> {
        Ok(HookOutcome::Pass)
    }

    /// Reply as it is about to be sent to the originating master.
    async fn upstream_response(
        &self,
        _response: &Response,
        _ctx: &mut ScriptCtx,
    ) -> HookResult<Response> {
        Ok(HookOutcome::Pass)
    }
}
