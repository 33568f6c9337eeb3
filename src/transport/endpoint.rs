use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Framing;
use crate::config::{DataBits, Parity, StopBits};

/// A reachable Modbus TCP peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
}

impl TcpEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for TcpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// A serial line with its framing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialEndpoint {
    pub path: String,
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub data_bits: DataBits,
    #[serde(default)]
    pub stop_bits: StopBits,
    /// Override for the end-of-frame silence gap; derived from the baud
    /// rate when absent.
    #[serde(default, with = "humantime_serde::option")]
    pub inter_byte_timeout: Option<Duration>,
}

impl SerialEndpoint {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            parity: Parity::default(),
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
            inter_byte_timeout: None,
        }
    }

    /// End-of-frame gap: 3.5 character times, floored at 1750 µs as the
    /// standard prescribes for rates above 19200 baud.
    pub fn effective_inter_byte_timeout(&self) -> Duration {
        if let Some(timeout) = self.inter_byte_timeout {
            return timeout;
        }
        let char_time_us = 11.0 * 1_000_000.0 / self.baud_rate.max(1) as f64;
        let gap_us = (3.5 * char_time_us).max(1750.0);
        Duration::from_micros(gap_us as u64)
    }
}

impl std::fmt::Display for SerialEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} baud, {} data bits, {} parity, {} stop bits)",
            self.path, self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}

/// Either kind of Modbus attachment point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Tcp(TcpEndpoint),
    Serial(SerialEndpoint),
}

impl Endpoint {
    pub fn framing(&self) -> Framing {
        match self {
            Self::Tcp(_) => Framing::Tcp,
            Self::Serial(_) => Framing::Rtu,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(tcp) => tcp.fmt(f),
            Self::Serial(serial) => serial.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inter_byte_gap_slow_baud() {
        // 9600 baud: 3.5 chars of 11 bits each is well above the floor.
        let endpoint = SerialEndpoint::new("/dev/ttyUSB0", 9600);
        let gap = endpoint.effective_inter_byte_timeout();
        assert_eq!(gap.as_micros(), 4010);
    }

    #[test]
    fn test_inter_byte_gap_fast_baud_floor() {
        let endpoint = SerialEndpoint::new("/dev/ttyUSB0", 115_200);
        assert_eq!(endpoint.effective_inter_byte_timeout().as_micros(), 1750);
    }

    #[test]
    fn test_inter_byte_gap_override() {
        let mut endpoint = SerialEndpoint::new("/dev/ttyUSB0", 9600);
        endpoint.inter_byte_timeout = Some(Duration::from_millis(20));
        assert_eq!(
            endpoint.effective_inter_byte_timeout(),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_endpoint_serde() {
        let yaml = r#"
tcp:
  host: 127.0.0.1
  port: 5020
"#;
        let endpoint: Endpoint = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp(TcpEndpoint::new("127.0.0.1", 5020))
        );
        assert_eq!(endpoint.framing(), Framing::Tcp);

        let yaml = r#"
serial:
  path: /dev/ttyUSB0
  baud_rate: 19200
  parity: even
"#;
        let endpoint: Endpoint = serde_yaml::from_str(yaml).unwrap();
        match &endpoint {
            Endpoint::Serial(s) => {
                assert_eq!(s.parity, Parity::Even);
                assert_eq!(s.data_bits, DataBits::default());
            }
            other => panic!("unexpected endpoint: {:?}", other),
        }
        assert_eq!(endpoint.framing(), Framing::Rtu);
    }
}
