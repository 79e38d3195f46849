//! Inter-worker messages: the shapes crossing the channel between a network
//! worker and its two collaborators (the process owner and the bus worker).

use super::register::{NetworkConfig, RegisterType, SlaveConfig, WriteValues};
use super::scheduler::PollSpec;

/// Sent to a network worker.
#[derive(Debug, Clone)]
pub enum ToNetwork {
    Configure(NetworkConfig),
    SetPollSpecification(PollSpec),
    Write(WriteValues),
    UpdateSlaveConfig(SlaveConfig),
    MqttNetworkState { is_up: bool },
    EndWork,
}

/// Emitted by a network worker, consumed by the bus worker and logged by the
/// process owner.
#[derive(Debug, Clone)]
pub enum FromNetwork {
    RegisterValues {
        slave: super::register::SlaveAddress,
        kind: RegisterType,
        first_register: u16,
        values: Vec<u16>,
    },
    ReadFailed {
        slave: super::register::SlaveAddress,
        kind: RegisterType,
        first_register: u16,
    },
    WriteFailed {
        slave: super::register::SlaveAddress,
        kind: RegisterType,
        first_register: u16,
    },
    ModbusNetworkState {
        name: String,
        is_up: bool,
    },
    /// The write queue crossed a usage watermark; the bus side can use this
    /// to slow down or warn publishers instead of flooding a saturated link.
    Backpressure {
        name: String,
        is_low: bool,
    },
}
