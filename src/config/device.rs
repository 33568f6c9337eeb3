//! The emulated-device description the mock server serves from.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::{ExceptionCode, RegisterKind};
use crate::errors::ConfigError;

/// Initial value of one register or coil.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialValue {
    Bit(bool),
    Word(u16),
}

/// One contiguous block of the register map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RegisterKind,
    pub start: u16,
    pub length: u16,
    /// Defaults by table: holding/coil writable, input/discrete not.
    #[serde(default)]
    pub writable: Option<bool>,
    #[serde(default)]
    pub initial: Vec<InitialValue>,
    #[serde(default)]
    pub description: String,
}

impl GroupConfig {
    pub fn effective_writable(&self) -> bool {
        self.writable.unwrap_or(self.kind.is_writable())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.length == 0 {
            return Err(ConfigError::invalid(format!(
                "group '{}' has zero length",
                self.name
            )));
        }
        if u32::from(self.start) + u32::from(self.length) > 0x1_0000 {
            return Err(ConfigError::invalid(format!(
                "group '{}' runs past the 16-bit address space",
                self.name
            )));
        }
        if self.initial.len() > self.length as usize {
            return Err(ConfigError::invalid(format!(
                "group '{}' has more initial values than registers",
                self.name
            )));
        }
        for value in &self.initial {
            match (self.kind.is_bit(), value) {
                (true, InitialValue::Word(_)) => {
                    return Err(ConfigError::invalid(format!(
                        "group '{}' is a bit table but has word initial values",
                        self.name
                    )));
                }
                (false, InitialValue::Bit(_)) => {
                    return Err(ConfigError::invalid(format!(
                        "group '{}' is a word table but has bool initial values",
                        self.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Per-address behavior override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleMode {
    FrozenValue,
    IgnoreWrite,
    Exception,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub mode: RuleMode,
    /// Required iff `mode = frozen-value`.
    #[serde(default)]
    pub forced_value: Option<u16>,
    /// Required iff `mode = exception`.
    #[serde(default)]
    pub exception_code: Option<u8>,
}

impl RuleConfig {
    fn validate(&self, address: &str) -> Result<(), ConfigError> {
        match self.mode {
            RuleMode::FrozenValue if self.forced_value.is_none() => Err(ConfigError::invalid(
                format!("rule at {}: frozen-value needs forced_value", address),
            )),
            RuleMode::Exception => {
                let code = self.exception_code.ok_or_else(|| {
                    ConfigError::invalid(format!(
                        "rule at {}: exception needs exception_code",
                        address
                    ))
                })?;
                ExceptionCode::from_u8(code).map(|_| ()).ok_or_else(|| {
                    ConfigError::invalid(format!(
                        "rule at {}: unknown exception code {}",
                        address, code
                    ))
                })
            }
            _ => Ok(()),
        }
    }
}

/// Fault-injection profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FaultConfig {
    pub latency_ms: u32,
    pub drop_rate: f32,
    pub bit_flip_rate: f32,
    pub forced_exception: Option<u8>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            drop_rate: 0.0,
            bit_flip_rate: 0.0,
            forced_exception: None,
        }
    }
}

impl FaultConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(ConfigError::invalid("drop_rate must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.bit_flip_rate) {
            return Err(ConfigError::invalid("bit_flip_rate must be within [0, 1]"));
        }
        if let Some(code) = self.forced_exception {
            if ExceptionCode::from_u8(code).is_none() {
                return Err(ConfigError::invalid(format!(
                    "unknown forced exception code {}",
                    code
                )));
            }
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

/// One script attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptConfig {
    /// Registry name of the script.
    pub path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Complete emulated-device description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub device_name: String,
    pub unit_id: u8,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// String-keyed by decimal address; applies to holding registers.
    #[serde(default)]
    pub rules: HashMap<String, RuleConfig>,
    #[serde(default)]
    pub faults: FaultConfig,
    #[serde(default)]
    pub scripts: Vec<ScriptConfig>,
}

impl DeviceConfig {
    /// Loads YAML or JSON, dispatching on the file extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::load(path, e.to_string()))?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| ConfigError::load(path, e.to_string()))?,
            _ => serde_yaml::from_str(&content)
                .map_err(|e| ConfigError::load(path, e.to_string()))?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for group in &self.groups {
            group.validate()?;
        }
        // Group overlap within one table is a load-time failure.
        for (i, a) in self.groups.iter().enumerate() {
            for b in self.groups.iter().skip(i + 1) {
                if a.kind == b.kind
                    && a.start < b.start + b.length
                    && b.start < a.start + a.length
                {
                    return Err(ConfigError::invalid(format!(
                        "groups '{}' and '{}' overlap in the {} table",
                        a.name, b.name, a.kind
                    )));
                }
            }
        }

        for (address, rule) in &self.rules {
            address.parse::<u16>().map_err(|_| {
                ConfigError::invalid(format!("rule key '{}' is not a decimal address", address))
            })?;
            rule.validate(address)?;
        }

        self.faults.validate()
    }

    /// Rules with their parsed addresses. Call after `validate`.
    pub fn parsed_rules(&self) -> impl Iterator<Item = (u16, &RuleConfig)> {
        self.rules
            .iter()
            .filter_map(|(address, rule)| Some((address.parse::<u16>().ok()?, rule)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
device_name: boiler-plc
unit_id: 1
groups:
  - name: temperatures
    type: holding
    start: 100
    length: 8
    initial: [250, 251, 252]
    description: Zone temperatures in tenths of a degree
  - name: alarms
    type: coil
    start: 0
    length: 16
    initial: [false, true]
rules:
  "104":
    mode: frozen-value
    forced_value: 1234
  "105":
    mode: ignore-write
  "106":
    mode: exception
    exception_code: 2
faults:
  latency_ms: 50
  drop_rate: 0.1
  bit_flip_rate: 0.0
scripts:
  - path: watchdog
    enabled: true
"#;

    #[test]
    fn test_parse_example() {
        let config: DeviceConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.device_name, "boiler-plc");
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.groups[0].kind, RegisterKind::Holding);
        assert!(config.groups[0].effective_writable());
        assert_eq!(
            config.groups[0].initial[0],
            InitialValue::Word(250)
        );
        assert_eq!(config.groups[1].initial[1], InitialValue::Bit(true));
        assert_eq!(config.rules.len(), 3);
        assert_eq!(config.faults.latency_ms, 50);
        assert!(config.scripts[0].enabled);
    }

    #[test]
    fn test_overlapping_groups_rejected() {
        let mut config: DeviceConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        config.groups.push(GroupConfig {
            name: "overlap".into(),
            kind: RegisterKind::Holding,
            start: 105,
            length: 4,
            writable: None,
            initial: Vec::new(),
            description: String::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_same_range_different_tables_allowed() {
        let mut config: DeviceConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        config.groups.push(GroupConfig {
            name: "inputs".into(),
            kind: RegisterKind::Input,
            start: 100,
            length: 8,
            writable: None,
            initial: Vec::new(),
            description: String::new(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rule_field_requirements() {
        let mut config: DeviceConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        config.rules.insert(
            "200".into(),
            RuleConfig {
                mode: RuleMode::FrozenValue,
                forced_value: None,
                exception_code: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_rule_key_rejected() {
        let mut config: DeviceConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        config.rules.insert(
            "not-a-number".into(),
            RuleConfig {
                mode: RuleMode::IgnoreWrite,
                forced_value: None,
                exception_code: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rate_bounds() {
        let mut config: DeviceConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        config.faults.drop_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.yaml");
        std::fs::write(&path, EXAMPLE).unwrap();

        let first = DeviceConfig::from_file(&path).unwrap();
        let second = DeviceConfig::from_file(&path).unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn test_json_equivalent() {
        let config: DeviceConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        let json = serde_json::to_string(&config).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        std::fs::write(&path, json).unwrap();

        let reloaded = DeviceConfig::from_file(&path).unwrap();
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            serde_json::to_value(&reloaded).unwrap()
        );
    }
}
