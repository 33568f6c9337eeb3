//! Request dispatch: faults, rules, store, hooks.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::codec::{
    ExceptionCode, Frame, FunctionCode, RegisterKind, Request, Response,
    MAX_REGISTERS_PER_REQUEST,
};
use crate::config::DeviceConfig;
use crate::errors::UmdtError;
use crate::events::{EventBus, EventKind, FaultKind};
use crate::script::{ChainOutcome, RegisterAccess, ServerScriptHost};

use super::faults::{FaultInjector, FaultProfile};
use super::rules::{exception_in_range, Rule, RuleMap};
use super::store::{RegisterStore, StoreSnapshot, StoreValue};

const MAX_BITS_PER_REQUEST: u16 = 2000;

/// Shared state of one emulated device.
///
/// The store sits behind a mutex (readers see consistent ranges, writers
/// are exclusive); the rule map swaps atomically so a request either runs
/// entirely under the old rules or entirely under the new ones.
pub struct ServerState {
    device_name: String,
    unit_id: u8,
    store: tokio::sync::Mutex<RegisterStore>,
    rules: RwLock<Arc<RuleMap>>,
    faults: FaultInjector,
    events: EventBus,
}

impl ServerState {
    pub fn new(config: &DeviceConfig, events: EventBus) -> Result<Arc<Self>, UmdtError> {
        let store = RegisterStore::from_config(config)?;
        let mut rules = RuleMap::new();
        for (address, rule) in config.parsed_rules() {
            // File-level rules bind to the holding table; the runtime API
            // takes the full key.
            rules.insert((RegisterKind::Holding, address), Rule::from_config(rule));
        }

        Ok(Arc::new(Self {
            device_name: config.device_name.clone(),
            unit_id: config.unit_id,
            store: tokio::sync::Mutex::new(store),
            rules: RwLock::new(Arc::new(rules)),
            faults: FaultInjector::new(FaultProfile::from(&config.faults)),
            events,
        }))
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // --- state API ------------------------------------------------------

    pub async fn get(&self, kind: RegisterKind, address: u16) -> Option<StoreValue> {
        self.store.lock().await.get(kind, address)
    }

    pub async fn set(
        &self,
        kind: RegisterKind,
        address: u16,
        value: StoreValue,
    ) -> Result<(), UmdtError> {
        self.store.lock().await.set(kind, address, value)
    }

    pub fn add_rule(&self, kind: RegisterKind, address: u16, rule: Rule) {
        let mut rules = self.rules.write().expect("rule map poisoned");
        let mut next = RuleMap::clone(&rules);
        next.insert((kind, address), rule);
        *rules = Arc::new(next);
    }

    pub fn remove_rule(&self, kind: RegisterKind, address: u16) {
        let mut rules = self.rules.write().expect("rule map poisoned");
        let mut next = RuleMap::clone(&rules);
        next.remove(&(kind, address));
        *rules = Arc::new(next);
    }

    pub fn update_faults(&self, profile: FaultProfile) {
        self.faults.update(profile);
    }

    pub fn fault_profile(&self) -> FaultProfile {
        self.faults.snapshot()
    }

    /// Replaces store, rules and faults from a fresh device config.
    pub async fn load_config(&self, config: &DeviceConfig) -> Result<(), UmdtError> {
        let store = RegisterStore::from_config(config)?;
        let mut rules = RuleMap::new();
        for (address, rule) in config.parsed_rules() {
            rules.insert((RegisterKind::Holding, address), Rule::from_config(rule));
        }

        *self.store.lock().await = store;
        *self.rules.write().expect("rule map poisoned") = Arc::new(rules);
        self.faults.update(FaultProfile::from(&config.faults));
        Ok(())
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.store.lock().await.snapshot()
    }

    // --- dispatch -------------------------------------------------------

    /// Serves one decoded frame per the dispatch pipeline; `None` means no
    /// response leaves the device (drop fault, unit mismatch, bad frame,
    /// script drop).
    pub async fn dispatch(
        self: &Arc<Self>,
        frame: &Frame,
        scripts: &ServerScriptHost,
    ) -> Option<Response> {
        if !frame.valid {
            if let Some(error) = frame.to_error() {
                self.events.publish(EventKind::Error {
                    message: error.to_string(),
                    raw: Some(frame.raw.clone()),
                });
            }
            return None;
        }
        if frame.unit_id != self.unit_id {
            debug!(
                "Ignoring request for unit {} (serving {})",
                frame.unit_id, self.unit_id
            );
            return None;
        }

        self.events.publish(EventKind::Request {
            unit_id: frame.unit_id,
            function: frame.function,
            raw: frame.raw.clone(),
        });

        // A request past this point runs entirely under the profile and
        // rule map it sampled here.
        let profile = self.faults.snapshot();
        let rules = Arc::clone(&self.rules.read().expect("rule map poisoned"));

        if self.faults.roll_drop(&profile) {
            self.events.publish(EventKind::FaultInjected {
                kind: FaultKind::Drop,
            });
            return None;
        }

        if !profile.latency.is_zero() {
            self.events.publish(EventKind::FaultInjected {
                kind: FaultKind::Latency,
            });
            tokio::time::sleep(profile.latency).await;
        }

        let request = Request::from_frame(frame);

        if let Some(code) = profile.forced_exception {
            self.events.publish(EventKind::FaultInjected {
                kind: FaultKind::ForcedException,
            });
            return Some(self.finish(Response::exception_for(&request, code), &profile));
        }

        let request = match scripts.run_request(request).await {
            ChainOutcome::Continue(request) => request,
            ChainOutcome::Exception(code) => {
                let request = Request::from_frame(frame);
                return Some(self.finish(
                    Response::exception_for(&request, code),
                    &profile,
                ));
            }
            ChainOutcome::Drop => return None,
        };

        let response = match self.execute(&request, &rules, scripts).await {
            Ok(response) => response,
            Err(e) => {
                // An internal failure must look like a sick slave, not a
                // dead one.
                error!("Internal dispatch failure: {}", e);
                self.events.publish(EventKind::Error {
                    message: format!("internal dispatch failure: {}", e),
                    raw: Some(frame.raw.clone()),
                });
                Response::exception_for(&request, ExceptionCode::ServerDeviceFailure)
            }
        };

        let response = match scripts.run_response(&request, response).await {
            ChainOutcome::Continue(response) => response,
            ChainOutcome::Exception(code) => Response::exception_for(&request, code),
            ChainOutcome::Drop => return None,
        };

        Some(self.finish(response, &profile))
    }

    /// Applies the outgoing bit-flip fault and emits the response event.
    fn finish(&self, mut response: Response, profile: &FaultProfile) -> Response {
        if self.faults.flip_bits(profile, &mut response.payload) > 0 {
            self.events.publish(EventKind::FaultInjected {
                kind: FaultKind::BitFlip,
            });
        }
        self.events.publish(EventKind::Response {
            unit_id: response.unit_id,
            function: response.function,
            is_exception: response.is_exception,
            exception_code: response.exception_code,
            raw: response.payload.clone(),
        });
        response
    }

    async fn execute(
        self: &Arc<Self>,
        request: &Request,
        rules: &RuleMap,
        scripts: &ServerScriptHost,
    ) -> Result<Response, UmdtError> {
        let exception = |code| Ok(Response::exception_for(request, code));

        let kind = match RegisterKind::of_function(request.function_code()) {
            Some(kind) => kind,
            None => {
                return match request.function_code() {
                    FunctionCode::EncapsulatedInterface => self.device_identification(request),
                    _ => exception(ExceptionCode::IllegalFunction),
                };
            }
        };

        match request.function_code() {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                // FC02 reads the discrete table even though of_function
                // reports coil semantics for writes.
                let kind = if request.function == 0x02 {
                    RegisterKind::Discrete
                } else {
                    RegisterKind::Coil
                };
                if request.quantity == 0 || request.quantity > MAX_BITS_PER_REQUEST {
                    return exception(ExceptionCode::IllegalDataValue);
                }
                if let Some(code) =
                    exception_in_range(rules, kind, request.address, request.quantity)
                {
                    return exception(code);
                }
                let bits = {
                    let store = self.store.lock().await;
                    match store.read_bits(kind, request.address, request.quantity) {
                        Ok(bits) => bits,
                        Err(code) => return exception(code),
                    }
                };
                let bits = self.apply_frozen_bits(rules, kind, request.address, bits);
                let mut payload = vec![bits.len().div_ceil(8) as u8];
                payload.extend_from_slice(&crate::codec::pack_bits(&bits));
                Ok(Response::new(request.unit_id, request.function, payload))
            }

            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                let kind = if request.function == 0x04 {
                    RegisterKind::Input
                } else {
                    RegisterKind::Holding
                };
                if request.quantity == 0 || request.quantity > MAX_REGISTERS_PER_REQUEST {
                    return exception(ExceptionCode::IllegalDataValue);
                }
                if let Some(code) =
                    exception_in_range(rules, kind, request.address, request.quantity)
                {
                    return exception(code);
                }
                let words = {
                    let store = self.store.lock().await;
                    match store.read_words(kind, request.address, request.quantity) {
                        Ok(words) => words,
                        Err(code) => return exception(code),
                    }
                };
                let words = self.apply_frozen_words(rules, kind, request.address, words);
                let mut payload = vec![(words.len() * 2) as u8];
                for word in words {
                    payload.extend_from_slice(&word.to_be_bytes());
                }
                Ok(Response::new(request.unit_id, request.function, payload))
            }

            FunctionCode::WriteSingleCoil => {
                let value = match request.quantity {
                    0xFF00 => true,
                    0x0000 => false,
                    _ => return exception(ExceptionCode::IllegalDataValue),
                };
                if let Some(code) = exception_in_range(rules, kind, request.address, 1) {
                    return exception(code);
                }
                if let Err(code) = self
                    .commit_bit(rules, kind, request.address, value, scripts)
                    .await
                {
                    return exception(code);
                }
                // Echo response.
                Ok(Response::new(
                    request.unit_id,
                    request.function,
                    request.encode_payload(),
                ))
            }

            FunctionCode::WriteSingleRegister => {
                if let Some(code) = exception_in_range(rules, kind, request.address, 1) {
                    return exception(code);
                }
                if let Err(code) = self
                    .commit_word(rules, kind, request.address, request.quantity, scripts)
                    .await
                {
                    return exception(code);
                }
                Ok(Response::new(
                    request.unit_id,
                    request.function,
                    request.encode_payload(),
                ))
            }

            FunctionCode::WriteMultipleCoils => {
                let count = request.quantity;
                if count == 0 || count > MAX_BITS_PER_REQUEST {
                    return exception(ExceptionCode::IllegalDataValue);
                }
                let data = request.tail.get(1..).unwrap_or_default();
                if data.len() < (count as usize).div_ceil(8) {
                    return exception(ExceptionCode::IllegalDataValue);
                }
                if let Some(code) = exception_in_range(rules, kind, request.address, count) {
                    return exception(code);
                }
                let mut writes = Vec::with_capacity(count as usize);
                for offset in 0..count {
                    let address = match request.address.checked_add(offset) {
                        Some(address) => address,
                        None => return exception(ExceptionCode::IllegalDataAddress),
                    };
                    let bit = data[offset as usize / 8] & (1 << (offset % 8)) != 0;
                    writes.push((address, bit));
                }
                match self.commit_bits(rules, kind, &writes, scripts).await {
                    Ok(()) => {}
                    Err(code) => return exception(code),
                }
                let mut payload = request.address.to_be_bytes().to_vec();
                payload.extend_from_slice(&count.to_be_bytes());
                Ok(Response::new(request.unit_id, request.function, payload))
            }

            FunctionCode::WriteMultipleRegisters => {
                let count = request.quantity;
                if count == 0 || count > MAX_REGISTERS_PER_REQUEST {
                    return exception(ExceptionCode::IllegalDataValue);
                }
                let data = request.tail.get(1..).unwrap_or_default();
                if data.len() < count as usize * 2 {
                    return exception(ExceptionCode::IllegalDataValue);
                }
                if let Some(code) = exception_in_range(rules, kind, request.address, count) {
                    return exception(code);
                }
                let mut writes = Vec::with_capacity(count as usize);
                for offset in 0..count {
                    let address = match request.address.checked_add(offset) {
                        Some(address) => address,
                        None => return exception(ExceptionCode::IllegalDataAddress),
                    };
                    let index = offset as usize * 2;
                    writes.push((address, u16::from_be_bytes([data[index], data[index + 1]])));
                }
                match self.commit_words(rules, kind, &writes, scripts).await {
                    Ok(()) => {}
                    Err(code) => return exception(code),
                }
                let mut payload = request.address.to_be_bytes().to_vec();
                payload.extend_from_slice(&count.to_be_bytes());
                Ok(Response::new(request.unit_id, request.function, payload))
            }

            FunctionCode::ReadWriteMultipleRegisters => {
                self.read_write_registers(request, rules, scripts).await
            }

            _ => exception(ExceptionCode::IllegalFunction),
        }
    }

    /// FC23: write first, then read, per the standard.
    async fn read_write_registers(
        self: &Arc<Self>,
        request: &Request,
        rules: &RuleMap,
        scripts: &ServerScriptHost,
    ) -> Result<Response, UmdtError> {
        let exception = |code| Ok(Response::exception_for(request, code));
        let kind = RegisterKind::Holding;

        let payload = &request.payload;
        if payload.len() < 9 {
            return exception(ExceptionCode::IllegalDataValue);
        }
        let read_address = u16::from_be_bytes([payload[0], payload[1]]);
        let read_count = u16::from_be_bytes([payload[2], payload[3]]);
        let write_address = u16::from_be_bytes([payload[4], payload[5]]);
        let write_count = u16::from_be_bytes([payload[6], payload[7]]);
        let data = &payload[9..];

        if read_count == 0
            || read_count > MAX_REGISTERS_PER_REQUEST
            || write_count == 0
            || write_count > MAX_REGISTERS_PER_REQUEST
            || data.len() < write_count as usize * 2
        {
            return exception(ExceptionCode::IllegalDataValue);
        }
        if let Some(code) = exception_in_range(rules, kind, write_address, write_count)
            .or_else(|| exception_in_range(rules, kind, read_address, read_count))
        {
            return exception(code);
        }

        let mut writes = Vec::with_capacity(write_count as usize);
        for offset in 0..write_count {
            let address = match write_address.checked_add(offset) {
                Some(address) => address,
                None => return exception(ExceptionCode::IllegalDataAddress),
            };
            let index = offset as usize * 2;
            writes.push((address, u16::from_be_bytes([data[index], data[index + 1]])));
        }
        if let Err(code) = self.commit_words(rules, kind, &writes, scripts).await {
            return exception(code);
        }

        let words = {
            let store = self.store.lock().await;
            match store.read_words(kind, read_address, read_count) {
                Ok(words) => words,
                Err(code) => return exception(code),
            }
        };
        let words = self.apply_frozen_words(rules, kind, read_address, words);
        let mut out = vec![(words.len() * 2) as u8];
        for word in words {
            out.extend_from_slice(&word.to_be_bytes());
        }
        Ok(Response::new(request.unit_id, request.function, out))
    }

    /// FC43/14: basic device identification from the config.
    fn device_identification(&self, request: &Request) -> Result<Response, UmdtError> {
        if request.payload.first() != Some(&0x0E) {
            return Ok(Response::exception_for(
                request,
                ExceptionCode::IllegalFunction,
            ));
        }

        let objects: [(u8, &str); 3] = [
            (0x00, "UMDT"),
            (0x01, self.device_name.as_str()),
            (0x02, env!("CARGO_PKG_VERSION")),
        ];

        let mut payload = vec![
            0x0E, // MEI type
            0x01, // read device id: basic
            0x01, // conformity level
            0x00, // no more follows
            0x00, // next object id
            objects.len() as u8,
        ];
        for (id, text) in objects {
            payload.push(id);
            payload.push(text.len() as u8);
            payload.extend_from_slice(text.as_bytes());
        }
        Ok(Response::new(request.unit_id, request.function, payload))
    }

    fn apply_frozen_words(
        &self,
        rules: &RuleMap,
        kind: RegisterKind,
        start: u16,
        mut words: Vec<u16>,
    ) -> Vec<u16> {
        for (offset, word) in words.iter_mut().enumerate() {
            if let Some(Rule::FrozenValue(value)) = rules.get(&(kind, start + offset as u16)) {
                *word = *value;
            }
        }
        words
    }

    fn apply_frozen_bits(
        &self,
        rules: &RuleMap,
        kind: RegisterKind,
        start: u16,
        mut bits: Vec<bool>,
    ) -> Vec<bool> {
        for (offset, bit) in bits.iter_mut().enumerate() {
            if let Some(Rule::FrozenValue(value)) = rules.get(&(kind, start + offset as u16)) {
                *bit = *value != 0;
            }
        }
        bits
    }

    /// One word write: rule modifiers may swallow it, the store may reject
    /// it; a committed write notifies `on_write`.
    async fn commit_word(
        self: &Arc<Self>,
        rules: &RuleMap,
        kind: RegisterKind,
        address: u16,
        value: u16,
        scripts: &ServerScriptHost,
    ) -> Result<(), ExceptionCode> {
        self.commit_words(rules, kind, &[(address, value)], scripts)
            .await
    }

    async fn commit_bit(
        self: &Arc<Self>,
        rules: &RuleMap,
        kind: RegisterKind,
        address: u16,
        value: bool,
        scripts: &ServerScriptHost,
    ) -> Result<(), ExceptionCode> {
        self.commit_bits(rules, kind, &[(address, value)], scripts)
            .await
    }

    /// Commits a run of word writes under one store lock, so a concurrent
    /// read never sees half of a multi-register value. Addresses swallowed
    /// by a rule stay untouched; `on_write` fires only for committed ones.
    async fn commit_words(
        self: &Arc<Self>,
        rules: &RuleMap,
        kind: RegisterKind,
        writes: &[(u16, u16)],
        scripts: &ServerScriptHost,
    ) -> Result<(), ExceptionCode> {
        let mut committed = Vec::with_capacity(writes.len());
        {
            let mut store = self.store.lock().await;
            for &(address, value) in writes {
                if rules
                    .get(&(kind, address))
                    .is_some_and(Rule::suppresses_write)
                {
                    debug!("Write to {} {} swallowed by rule", kind, address);
                    continue;
                }
                store.write_word(kind, address, value)?;
                committed.push((address, value));
            }
        }
        for (address, value) in committed {
            scripts.run_write(self.unit_id, address, value).await;
        }
        Ok(())
    }

    async fn commit_bits(
        self: &Arc<Self>,
        rules: &RuleMap,
        kind: RegisterKind,
        writes: &[(u16, bool)],
        scripts: &ServerScriptHost,
    ) -> Result<(), ExceptionCode> {
        let mut committed = Vec::with_capacity(writes.len());
        {
            let mut store = self.store.lock().await;
            for &(address, value) in writes {
                if rules
                    .get(&(kind, address))
                    .is_some_and(Rule::suppresses_write)
                {
                    debug!("Write to {} {} swallowed by rule", kind, address);
                    continue;
                }
                store.write_bit(kind, address, value)?;
                committed.push((address, value));
            }
        }
        for (address, value) in committed {
            scripts
                .run_write(self.unit_id, address, u16::from(value))
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl RegisterAccess for ServerState {
    async fn read_register(
        &self,
        _unit_id: u8,
        address: u16,
        kind: RegisterKind,
    ) -> Result<u16, UmdtError> {
        match self.get(kind, address).await {
            Some(StoreValue::Word(word)) => Ok(word),
            Some(StoreValue::Bit(bit)) => Ok(u16::from(bit)),
            None => Err(UmdtError::invalid_argument(format!(
                "no {} register at {}",
                kind, address
            ))),
        }
    }

    async fn write_register(
        &self,
        _unit_id: u8,
        address: u16,
        value: u16,
        kind: RegisterKind,
    ) -> Result<(), UmdtError> {
        let store_value = if kind.is_bit() {
            StoreValue::Bit(value != 0)
        } else {
            StoreValue::Word(value)
        };
        self.set(kind, address, store_value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::rtu;
    use crate::errors::ScriptError;
    use crate::script::{ScalarValue, ScriptCtx, ServerScript};
    use std::sync::Arc;

    fn state() -> Arc<ServerState> {
        let yaml = r#"
device_name: dispatch-test
unit_id: 9
groups:
  - name: data
    type: holding
    start: 0
    length: 16
    initial: [100, 200, 300]
  - name: flags
    type: coil
    start: 0
    length: 8
"#;
        let config: DeviceConfig = serde_yaml::from_str(yaml).unwrap();
        ServerState::new(&config, EventBus::default()).unwrap()
    }

    fn frame(unit: u8, function: u8, payload: &[u8]) -> Frame {
        rtu::decode(&rtu::encode(unit, function, payload))
    }

    fn empty_scripts() -> ServerScriptHost {
        ServerScriptHost::new(EventBus::default(), None)
    }

    #[tokio::test]
    async fn test_multi_register_write_and_readback() {
        let state = state();
        let scripts = empty_scripts();

        // FC16: write [7, 8] at address 4.
        let request = frame(
            9,
            0x10,
            &[0x00, 0x04, 0x00, 0x02, 0x04, 0x00, 0x07, 0x00, 0x08],
        );
        let response = state.dispatch(&request, &scripts).await.unwrap();
        assert!(!response.is_exception);
        assert_eq!(response.payload, vec![0x00, 0x04, 0x00, 0x02]);

        // FC03: read them back.
        let request = frame(9, 0x03, &[0x00, 0x04, 0x00, 0x02]);
        let response = state.dispatch(&request, &scripts).await.unwrap();
        assert_eq!(response.payload, vec![0x04, 0x00, 0x07, 0x00, 0x08]);
    }

    #[tokio::test]
    async fn test_read_write_multiple_registers() {
        let state = state();
        let scripts = empty_scripts();

        // FC23: read 2 regs at 0 while writing [9] at address 1.
        let request = frame(
            9,
            0x17,
            &[0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00, 0x01, 0x02, 0x00, 0x09],
        );
        let response = state.dispatch(&request, &scripts).await.unwrap();
        assert!(!response.is_exception);
        // Write happens before the read: register 1 reads back as 9.
        assert_eq!(response.payload, vec![0x04, 0x00, 0x64, 0x00, 0x09]);
    }

    #[tokio::test]
    async fn test_unit_mismatch_is_silent() {
        let state = state();
        let scripts = empty_scripts();
        let request = frame(3, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        assert!(state.dispatch(&request, &scripts).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_function_answers_illegal_function() {
        let state = state();
        let scripts = empty_scripts();
        let request = frame(9, 0x41, &[0x01, 0x02]);
        let response = state.dispatch(&request, &scripts).await.unwrap();
        assert_eq!(
            response.exception_code,
            Some(ExceptionCode::IllegalFunction)
        );
    }

    #[tokio::test]
    async fn test_forced_exception_fault() {
        let state = state();
        let scripts = empty_scripts();
        state.update_faults(FaultProfile {
            forced_exception: Some(ExceptionCode::ServerDeviceBusy),
            ..Default::default()
        });

        let request = frame(9, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        let response = state.dispatch(&request, &scripts).await.unwrap();
        assert_eq!(
            response.exception_code,
            Some(ExceptionCode::ServerDeviceBusy)
        );
    }

    #[tokio::test]
    async fn test_device_identification() {
        let state = state();
        let scripts = empty_scripts();
        let request = frame(9, 0x2B, &[0x0E, 0x01, 0x00]);
        let response = state.dispatch(&request, &scripts).await.unwrap();
        assert!(!response.is_exception);
        assert_eq!(response.payload[0], 0x0E);
        // The product-code object carries the configured device name.
        let text = String::from_utf8_lossy(&response.payload);
        assert!(text.contains("dispatch-test"));
    }

    struct WriteRecorder;

    #[async_trait]
    impl ServerScript for WriteRecorder {
        fn name(&self) -> &str {
            "write-recorder"
        }

        async fn on_write(
            &self,
            _unit_id: u8,
            address: u16,
            value: u16,
            ctx: &mut ScriptCtx,
        ) -> Result<(), ScriptError> {
            ctx.state.insert(
                format!("write:{}", address),
                ScalarValue::Int(i64::from(value)),
            );
            ctx.emit_event(
                "write-observed",
                serde_json::json!({ "address": address, "value": value }),
            );
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_on_write_hook_sees_committed_writes() {
        let state = state();
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        let scripts = ServerScriptHost::new(bus, None);
        scripts.install(vec![Arc::new(WriteRecorder)]).await;

        let request = frame(9, 0x06, &[0x00, 0x02, 0x30, 0x39]);
        let response = state.dispatch(&request, &scripts).await.unwrap();
        assert!(!response.is_exception);

        let mut observed = false;
        while let Some(event) = sub.try_recv() {
            if let EventKind::Custom { name, payload } = event.kind {
                assert_eq!(name, "write-observed");
                assert_eq!(payload["address"], 2);
                assert_eq!(payload["value"], 12345);
                observed = true;
            }
        }
        assert!(observed);
    }

    #[tokio::test]
    async fn test_crc_invalid_frame_not_served_but_reported() {
        let state = state();
        let scripts = empty_scripts();
        let mut sub = state.events().subscribe();

        let mut bytes = rtu::encode(9, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        bytes[2] ^= 0x01;
        let request = rtu::decode(&bytes);
        assert!(state.dispatch(&request, &scripts).await.is_none());

        let event = sub.try_recv().unwrap();
        match event.kind {
            EventKind::Error { raw, .. } => assert_eq!(raw.unwrap(), bytes),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
