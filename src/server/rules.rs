use std::collections::HashMap;

use crate::codec::{ExceptionCode, RegisterKind};
use crate::config::{RuleConfig, RuleMode};

/// Per-address behavior override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Reads answer this value; writes are accepted and discarded.
    FrozenValue(u16),
    /// Reads serve the store; writes are accepted and discarded.
    IgnoreWrite,
    /// Any access answers this exception.
    Exception(ExceptionCode),
}

impl Rule {
    pub fn from_config(config: &RuleConfig) -> Self {
        match config.mode {
            RuleMode::FrozenValue => Self::FrozenValue(config.forced_value.unwrap_or(0)),
            RuleMode::IgnoreWrite => Self::IgnoreWrite,
            RuleMode::Exception => Self::Exception(
                config
                    .exception_code
                    .and_then(ExceptionCode::from_u8)
                    .unwrap_or(ExceptionCode::IllegalDataAddress),
            ),
        }
    }

    /// Whether a protocol write to this address must leave the store alone.
    pub fn suppresses_write(&self) -> bool {
        matches!(self, Self::FrozenValue(_) | Self::IgnoreWrite)
    }
}

pub type RuleKey = (RegisterKind, u16);
pub type RuleMap = HashMap<RuleKey, Rule>;

/// First exception rule covering `[start, start+count)`, if any.
pub fn exception_in_range(
    rules: &RuleMap,
    kind: RegisterKind,
    start: u16,
    count: u16,
) -> Option<ExceptionCode> {
    (0..count)
        .filter_map(|offset| start.checked_add(offset))
        .find_map(|address| match rules.get(&(kind, address)) {
            Some(Rule::Exception(code)) => Some(*code),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_scan() {
        let mut rules = RuleMap::new();
        rules.insert(
            (RegisterKind::Holding, 5),
            Rule::Exception(ExceptionCode::ServerDeviceBusy),
        );
        rules.insert((RegisterKind::Holding, 7), Rule::IgnoreWrite);

        assert_eq!(
            exception_in_range(&rules, RegisterKind::Holding, 0, 10),
            Some(ExceptionCode::ServerDeviceBusy)
        );
        assert_eq!(exception_in_range(&rules, RegisterKind::Holding, 6, 4), None);
        assert_eq!(exception_in_range(&rules, RegisterKind::Input, 0, 10), None);
    }

    #[test]
    fn test_write_suppression() {
        assert!(Rule::FrozenValue(7).suppresses_write());
        assert!(Rule::IgnoreWrite.suppresses_write());
        assert!(!Rule::Exception(ExceptionCode::IllegalFunction).suppresses_write());
    }
}
