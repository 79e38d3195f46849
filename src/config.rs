//! TOML configuration: `device`/`baud`/`parity`/... for RTU networks,
//! `address`/`port` for TCP networks, `host`/`port`/`keepalive` for the
//! broker.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::{BusObject, MqttBrokerConfig};
use crate::core::register::{
    DelayPolicy, NetworkConfig, NetworkTransportConfig, Parity, RegisterType, RtsMode, SerialMode, SlaveConfig,
};
use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub mqtt: RawMqtt,
    #[serde(default)]
    pub network: Vec<RawNetwork>,
    #[serde(default)]
    pub object: Vec<RawObject>,
    #[serde(default)]
    pub slave: Vec<RawSlave>,
}

#[derive(Debug, Deserialize)]
pub struct RawMqtt {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keepalive_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct RawNetwork {
    pub name: String,

    // RTU fields.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub baud: Option<u32>,
    #[serde(default)]
    pub parity: Option<String>,
    #[serde(default)]
    pub data_bit: Option<u8>,
    #[serde(default)]
    pub stop_bit: Option<u8>,
    #[serde(default)]
    pub rtu_serial_mode: Option<String>,
    #[serde(default)]
    pub rtu_rts_mode: Option<String>,
    #[serde(default)]
    pub rtu_rts_delay_us: Option<u64>,

    // TCP fields.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_response_data_timeout_ms")]
    pub response_data_timeout_ms: u64,
    #[serde(default)]
    pub min_delay_before_poll_ms: u64,
    #[serde(default)]
    pub delay_before_command_ms: u64,
    #[serde(default)]
    pub delay_before_first_command_ms: u64,
}

fn default_response_timeout_ms() -> u64 {
    500
}

fn default_response_data_timeout_ms() -> u64 {
    200
}

/// Per-slave override of the network-wide `delay_before_command`, matched to
/// a network the same way `RawObject` is: by name, not by nesting.
#[derive(Debug, Deserialize)]
pub struct RawSlave {
    pub network: String,
    pub address: u8,
    #[serde(default)]
    pub delay_before_command_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct RawObject {
    pub network: String,
    pub slave: u8,
    pub kind: String,
    pub first_register: u16,
    pub count: u16,
    pub refresh_ms: u64,
    pub state_topic: String,
    #[serde(default)]
    pub command_topic: Option<String>,
}

pub struct BridgeConfig {
    pub mqtt: MqttBrokerConfig,
    pub networks: Vec<NetworkConfig>,
    pub objects: Vec<BusObject>,
    /// Per-network slave overrides, ready to send as `UpdateSlaveConfig`
    /// when priming each worker.
    pub slaves: Vec<(String, SlaveConfig)>,
}

pub fn load(path: &std::path::Path) -> Result<BridgeConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Parse(format!("reading {}: {e}", path.display())))?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<BridgeConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mqtt = MqttBrokerConfig {
        host: raw.mqtt.host,
        port: raw.mqtt.port,
        client_id: raw
            .mqtt
            .client_id
            .unwrap_or_else(|| format!("modmqtt-bridge-{}", uuid::Uuid::new_v4())),
        username: raw.mqtt.username,
        password: raw.mqtt.password,
        keep_alive: Duration::from_secs(raw.mqtt.keepalive),
    };

    let mut networks = Vec::with_capacity(raw.network.len());
    for net in raw.network {
        networks.push(parse_network(net)?);
    }

    let mut objects = Vec::with_capacity(raw.object.len());
    for obj in raw.object {
        objects.push(parse_object(obj)?);
    }

    let mut slaves = Vec::with_capacity(raw.slave.len());
    for slave in raw.slave {
        slaves.push((
            slave.network,
            SlaveConfig {
                address: slave.address,
                delay_before_command: DelayPolicy::every_time(Duration::from_millis(slave.delay_before_command_ms)),
            },
        ));
    }

    Ok(BridgeConfig { mqtt, networks, objects, slaves })
}

fn parse_network(raw: RawNetwork) -> Result<NetworkConfig, ConfigError> {
    let transport = if let Some(device) = raw.device {
        let baud = raw
            .baud
            .ok_or_else(|| ConfigError::MissingField("baud".into()))?;
        let parity = match raw.parity.as_deref() {
            Some("N") | None => Parity::N,
            Some("E") => Parity::E,
            Some("O") => Parity::O,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "parity".into(),
                    reason: format!("expected N/E/O, got `{other}`"),
                })
            }
        };
        let data_bits = raw.data_bit.unwrap_or(8);
        let stop_bits = raw.stop_bit.unwrap_or(1);
        let serial_mode = match raw.rtu_serial_mode.as_deref() {
            None => None,
            Some("rs232") => Some(SerialMode::Rs232),
            Some("rs485") => Some(SerialMode::Rs485),
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "rtu_serial_mode".into(),
                    reason: format!("expected rs232/rs485, got `{other}`"),
                })
            }
        };
        let rts_mode = match raw.rtu_rts_mode.as_deref() {
            None => None,
            Some("up") => Some(RtsMode::Up),
            Some("down") => Some(RtsMode::Down),
            Some("none") => Some(RtsMode::None),
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "rtu_rts_mode".into(),
                    reason: format!("expected up/down/none, got `{other}`"),
                })
            }
        };
        NetworkTransportConfig::Rtu {
            device,
            baud,
            parity,
            data_bits,
            stop_bits,
            serial_mode,
            rts_mode,
            rts_delay_us: raw.rtu_rts_delay_us,
        }
    } else if let Some(address) = raw.address {
        let port = raw.port.ok_or_else(|| ConfigError::MissingField("port".into()))?;
        NetworkTransportConfig::Tcp { host: address, port }
    } else {
        return Err(ConfigError::InvalidValue {
            field: "network".into(),
            reason: format!("network `{}` needs either `device` (RTU) or `address` (TCP)", raw.name),
        });
    };

    Ok(NetworkConfig {
        name: raw.name,
        transport,
        response_timeout: Duration::from_millis(raw.response_timeout_ms),
        response_data_timeout: Duration::from_millis(raw.response_data_timeout_ms),
        min_delay_before_poll: Duration::from_millis(raw.min_delay_before_poll_ms),
        delay_before_command: Duration::from_millis(raw.delay_before_command_ms),
        delay_before_first_command: Duration::from_millis(raw.delay_before_first_command_ms),
    })
}

fn parse_object(raw: RawObject) -> Result<BusObject, ConfigError> {
    let kind = match raw.kind.as_str() {
        "coil" => RegisterType::Coil,
        "bit" | "discrete" => RegisterType::Bit,
        "holding" => RegisterType::Holding,
        "input" => RegisterType::Input,
        other => {
            return Err(ConfigError::InvalidValue {
                field: "kind".into(),
                reason: format!("expected coil/bit/holding/input, got `{other}`"),
            })
        }
    };
    Ok(BusObject {
        network: raw.network,
        slave: raw.slave,
        kind,
        first_register: raw.first_register,
        count: raw.count,
        refresh: Duration::from_millis(raw.refresh_ms),
        state_topic: raw.state_topic,
        command_topic: raw.command_topic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_rtu_network_and_object() {
        let text = r#"
            [mqtt]
            host = "localhost"

            [[network]]
            name = "line1"
            device = "/dev/ttyUSB0"
            baud = 9600
            parity = "N"
            data_bit = 8
            stop_bit = 1

            [[object]]
            network = "line1"
            slave = 3
            kind = "holding"
            first_register = 1
            count = 2
            refresh_ms = 1000
            state_topic = "line1/slave3/holding"
        "#;
        let cfg = parse(text).unwrap();
        assert_eq!(cfg.networks.len(), 1);
        assert_eq!(cfg.networks[0].name, "line1");
        assert_eq!(cfg.objects.len(), 1);
        assert_eq!(cfg.objects[0].slave, 3);
    }

    #[test]
    fn parses_a_per_slave_delay_override() {
        let text = r#"
            [mqtt]
            host = "localhost"

            [[network]]
            name = "line1"
            device = "/dev/ttyUSB0"
            baud = 9600
            parity = "N"
            data_bit = 8
            stop_bit = 1

            [[slave]]
            network = "line1"
            address = 1
            delay_before_command_ms = 100
        "#;
        let cfg = parse(text).unwrap();
        assert_eq!(cfg.slaves.len(), 1);
        let (network, slave) = &cfg.slaves[0];
        assert_eq!(network, "line1");
        assert_eq!(slave.address, 1);
        assert_eq!(slave.delay_before_command.duration, Duration::from_millis(100));
    }

    #[test]
    fn rejects_network_without_device_or_address() {
        let text = r#"
            [mqtt]
            host = "localhost"

            [[network]]
            name = "bad"
        "#;
        let err = parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_unknown_register_kind() {
        let text = r#"
            [mqtt]
            host = "localhost"

            [[network]]
            name = "line1"
            address = "10.0.0.5"
            port = 502

            [[object]]
            network = "line1"
            slave = 1
            kind = "nonsense"
            first_register = 1
            count = 1
            refresh_ms = 1000
            state_topic = "x"
        "#;
        let err = parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
