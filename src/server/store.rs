//! The emulated register map.

use serde::Serialize;

use crate::codec::{ExceptionCode, RegisterKind};
use crate::config::{DeviceConfig, GroupConfig, InitialValue};
use crate::errors::{ConfigError, UmdtError};

/// One register or coil value, as the state API sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StoreValue {
    Bit(bool),
    Word(u16),
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum GroupValues {
    Words(Vec<u16>),
    Bits(Vec<bool>),
}

/// A contiguous, named block of one register table.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterGroup {
    pub name: String,
    pub kind: RegisterKind,
    pub start: u16,
    pub length: u16,
    pub writable: bool,
    pub description: String,
    values: GroupValues,
}

impl RegisterGroup {
    fn from_config(config: &GroupConfig) -> Self {
        let length = config.length as usize;
        let values = if config.kind.is_bit() {
            let mut bits = vec![false; length];
            for (i, value) in config.initial.iter().enumerate() {
                if let InitialValue::Bit(bit) = value {
                    bits[i] = *bit;
                }
            }
            GroupValues::Bits(bits)
        } else {
            let mut words = vec![0u16; length];
            for (i, value) in config.initial.iter().enumerate() {
                if let InitialValue::Word(word) = value {
                    words[i] = *word;
                }
            }
            GroupValues::Words(words)
        };

        Self {
            name: config.name.clone(),
            kind: config.kind,
            start: config.start,
            length: config.length,
            writable: config.effective_writable(),
            description: config.description.clone(),
            values,
        }
    }

    fn contains(&self, address: u16) -> bool {
        address >= self.start && u32::from(address) < u32::from(self.start) + u32::from(self.length)
    }
}

/// Serializable dump of the whole map.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub groups: Vec<RegisterGroup>,
}

/// All groups of one emulated device.
///
/// Group overlap within a table is rejected at load; reads that touch any
/// unmapped address answer `IllegalDataAddress`, exactly like a device with
/// holes in its map.
#[derive(Debug)]
pub struct RegisterStore {
    groups: Vec<RegisterGroup>,
}

impl RegisterStore {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            groups: config.groups.iter().map(RegisterGroup::from_config).collect(),
        })
    }

    fn group(&self, kind: RegisterKind, address: u16) -> Option<&RegisterGroup> {
        self.groups
            .iter()
            .find(|g| g.kind == kind && g.contains(address))
    }

    fn group_mut(&mut self, kind: RegisterKind, address: u16) -> Option<&mut RegisterGroup> {
        self.groups
            .iter_mut()
            .find(|g| g.kind == kind && g.contains(address))
    }

    pub fn read_words(
        &self,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ExceptionCode> {
        let mut out = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let address = start
                .checked_add(offset)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            let group = self
                .group(kind, address)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            match &group.values {
                GroupValues::Words(words) => {
                    out.push(words[(address - group.start) as usize]);
                }
                GroupValues::Bits(_) => return Err(ExceptionCode::IllegalDataAddress),
            }
        }
        Ok(out)
    }

    pub fn read_bits(
        &self,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, ExceptionCode> {
        let mut out = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let address = start
                .checked_add(offset)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            let group = self
                .group(kind, address)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            match &group.values {
                GroupValues::Bits(bits) => {
                    out.push(bits[(address - group.start) as usize]);
                }
                GroupValues::Words(_) => return Err(ExceptionCode::IllegalDataAddress),
            }
        }
        Ok(out)
    }

    /// Protocol-path write: honors the group's `writable` flag.
    pub fn write_word(
        &mut self,
        kind: RegisterKind,
        address: u16,
        value: u16,
    ) -> Result<(), ExceptionCode> {
        let group = self
            .group_mut(kind, address)
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        if !group.writable {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        match &mut group.values {
            GroupValues::Words(words) => {
                words[(address - group.start) as usize] = value;
                Ok(())
            }
            GroupValues::Bits(_) => Err(ExceptionCode::IllegalDataAddress),
        }
    }

    /// Protocol-path coil write: honors the group's `writable` flag.
    pub fn write_bit(
        &mut self,
        kind: RegisterKind,
        address: u16,
        value: bool,
    ) -> Result<(), ExceptionCode> {
        let group = self
            .group_mut(kind, address)
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        if !group.writable {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        match &mut group.values {
            GroupValues::Bits(bits) => {
                bits[(address - group.start) as usize] = value;
                Ok(())
            }
            GroupValues::Words(_) => Err(ExceptionCode::IllegalDataAddress),
        }
    }

    /// State-API read: any mapped address, no protocol semantics.
    pub fn get(&self, kind: RegisterKind, address: u16) -> Option<StoreValue> {
        let group = self.group(kind, address)?;
        Some(match &group.values {
            GroupValues::Words(words) => {
                StoreValue::Word(words[(address - group.start) as usize])
            }
            GroupValues::Bits(bits) => StoreValue::Bit(bits[(address - group.start) as usize]),
        })
    }

    /// State-API write: bypasses `writable`, so operators and scripts can
    /// mutate read-only tables (that is the point of a mock).
    pub fn set(
        &mut self,
        kind: RegisterKind,
        address: u16,
        value: StoreValue,
    ) -> Result<(), UmdtError> {
        let group = self.group_mut(kind, address).ok_or_else(|| {
            UmdtError::invalid_argument(format!("no {} group covers address {}", kind, address))
        })?;
        match (&mut group.values, value) {
            (GroupValues::Words(words), StoreValue::Word(word)) => {
                words[(address - group.start) as usize] = word;
                Ok(())
            }
            (GroupValues::Bits(bits), StoreValue::Bit(bit)) => {
                bits[(address - group.start) as usize] = bit;
                Ok(())
            }
            _ => Err(UmdtError::invalid_argument(
                "value type does not match the register table",
            )),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            groups: self.groups.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RegisterStore {
        let yaml = r#"
device_name: test
unit_id: 1
groups:
  - name: block-a
    type: holding
    start: 0
    length: 4
    initial: [1, 2, 3, 4]
  - name: block-b
    type: holding
    start: 4
    length: 4
    initial: [5, 6, 7, 8]
  - name: sensors
    type: input
    start: 0
    length: 2
    initial: [99]
  - name: flags
    type: coil
    start: 10
    length: 8
    initial: [true]
"#;
        let config: DeviceConfig = serde_yaml::from_str(yaml).unwrap();
        RegisterStore::from_config(&config).unwrap()
    }

    #[test]
    fn test_read_spanning_adjacent_groups() {
        let store = store();
        // 0..=7 crosses the block-a/block-b boundary.
        let words = store.read_words(RegisterKind::Holding, 2, 4).unwrap();
        assert_eq!(words, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_read_past_coverage_fails() {
        let store = store();
        assert_eq!(
            store.read_words(RegisterKind::Holding, 6, 4),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            store.read_words(RegisterKind::Input, 100, 1),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn test_write_honors_writable_flag() {
        let mut store = store();
        store.write_word(RegisterKind::Holding, 0, 42).unwrap();
        assert_eq!(
            store.get(RegisterKind::Holding, 0),
            Some(StoreValue::Word(42))
        );

        // Input registers default to read-only on the protocol path.
        assert_eq!(
            store.write_word(RegisterKind::Input, 0, 1),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn test_state_api_bypasses_writable() {
        let mut store = store();
        store
            .set(RegisterKind::Input, 0, StoreValue::Word(1234))
            .unwrap();
        assert_eq!(
            store.get(RegisterKind::Input, 0),
            Some(StoreValue::Word(1234))
        );
    }

    #[test]
    fn test_coils() {
        let mut store = store();
        assert_eq!(
            store.read_bits(RegisterKind::Coil, 10, 2).unwrap(),
            vec![true, false]
        );
        store.write_bit(RegisterKind::Coil, 11, true).unwrap();
        assert_eq!(
            store.get(RegisterKind::Coil, 11),
            Some(StoreValue::Bit(true))
        );
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut store = store();
        assert!(store
            .set(RegisterKind::Coil, 10, StoreValue::Word(1))
            .is_err());
        assert_eq!(
            store.read_bits(RegisterKind::Holding, 0, 1),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }
}
