//! Register descriptors: the plain data that describes what to poll or write
//! and how much silence must precede the transaction.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One of the four Modbus register spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum RegisterType {
    Coil,
    Bit,
    Holding,
    Input,
}

impl RegisterType {
    /// Coil and Bit carry one boolean per register; Holding/Input a 16-bit word.
    pub fn is_boolean(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Bit)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Holding)
    }
}

/// 1..247; 0 is accepted and mapped to the transport's broadcast/default id.
pub type SlaveAddress = u8;

/// `refresh = 0` means "as fast as possible"; this sentinel means "declared
/// in the modbus section but unreferenced by any bus object" and must be
/// dropped before scheduling.
pub const INVALID_REFRESH: Duration = Duration::from_secs(u64::MAX / 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRef {
    pub slave: SlaveAddress,
    /// 1-based.
    pub first_register: u16,
    pub count: u16,
    pub kind: RegisterType,
}

impl RegisterRef {
    /// `first_register + count - 1` fits the address space of `kind`.
    pub fn last_register(&self) -> u16 {
        self.first_register + self.count - 1
    }

    pub fn overlaps(&self, other: &RegisterRef) -> bool {
        self.slave == other.slave
            && self.kind == other.kind
            && self.first_register <= other.last_register()
            && other.first_register <= self.last_register()
    }

    pub fn adjacent(&self, other: &RegisterRef) -> bool {
        self.slave == other.slave
            && self.kind == other.kind
            && (self.last_register() + 1 == other.first_register
                || other.last_register() + 1 == self.first_register)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelayKind {
    Never,
    OnSlaveChange,
    EveryTime,
}

/// Minimum silence that must elapse before a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPolicy {
    pub duration: Duration,
    pub kind: DelayKind,
}

impl DelayPolicy {
    pub const NEVER: DelayPolicy = DelayPolicy {
        duration: Duration::ZERO,
        kind: DelayKind::Never,
    };

    pub fn every_time(duration: Duration) -> Self {
        Self {
            duration,
            kind: DelayKind::EveryTime,
        }
    }

    pub fn on_slave_change(duration: Duration) -> Self {
        Self {
            duration,
            kind: DelayKind::OnSlaveChange,
        }
    }

    /// Required silence given the slave the previous command targeted.
    pub fn required_silence(&self, target_slave: SlaveAddress, last_slave: Option<SlaveAddress>) -> Duration {
        match self.kind {
            DelayKind::Never => Duration::ZERO,
            DelayKind::EveryTime => self.duration,
            DelayKind::OnSlaveChange => {
                if last_slave != Some(target_slave) {
                    self.duration
                } else {
                    Duration::ZERO
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegisterPoll {
    pub register: RegisterRef,
    pub refresh: Duration,
    pub delay: DelayPolicy,
    pub last_read_at: Option<Instant>,
    pub initial_done: bool,
}

impl RegisterPoll {
    pub fn new(register: RegisterRef, refresh: Duration, delay: DelayPolicy) -> Self {
        Self {
            register,
            refresh,
            delay,
            last_read_at: None,
            initial_done: false,
        }
    }

    /// True when this poll's deadline (`last_read_at + refresh`) is at or before `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_read_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.refresh,
        }
    }

    /// Remaining time until this poll becomes due; zero if already due.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_read_at {
            None => Duration::ZERO,
            Some(last) => {
                let deadline = last + self.refresh;
                deadline.saturating_duration_since(now)
            }
        }
    }

    pub fn mark_read(&mut self, now: Instant) {
        self.last_read_at = Some(now);
        self.initial_done = true;
    }

    /// Reconnect: every poll gets re-executed at least once before any poll's
    /// second execution on the new epoch.
    pub fn reset_epoch(&mut self) {
        self.last_read_at = None;
        self.initial_done = false;
    }
}

/// Payload re-published on a successful write to a polled register, so the
/// bus observes the new value without waiting for the next poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteValues {
    pub slave: SlaveAddress,
    pub kind: RegisterType,
    pub first_register: u16,
    pub values: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct RegisterWrite {
    pub target: RegisterRef,
    pub values: Vec<u16>,
    pub echo: Option<WriteValues>,
    /// Base silence policy for this write, same as a poll's — the
    /// network/slave default unless a per-slave override applies at pop time.
    pub delay: DelayPolicy,
}

/// Per-slave attributes not yet covered by `RegisterPoll` defaults.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub address: SlaveAddress,
    pub delay_before_command: DelayPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    N,
    E,
    O,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialMode {
    Rs232,
    Rs485,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtsMode {
    Up,
    Down,
    None,
}

#[derive(Debug, Clone)]
pub enum NetworkTransportConfig {
    Rtu {
        device: String,
        baud: u32,
        parity: Parity,
        data_bits: u8,
        stop_bits: u8,
        serial_mode: Option<SerialMode>,
        rts_mode: Option<RtsMode>,
        rts_delay_us: Option<u64>,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub name: String,
    pub transport: NetworkTransportConfig,
    pub response_timeout: Duration,
    pub response_data_timeout: Duration,
    pub min_delay_before_poll: Duration,
    pub delay_before_command: Duration,
    pub delay_before_first_command: Duration,
}

impl NetworkConfig {
    /// Fold the network-wide delay settings into a `DelayPolicy` for a poll
    /// that carries no stricter per-slave override.
    pub fn default_delay_policy(&self) -> DelayPolicy {
        if self.delay_before_command != Duration::ZERO {
            DelayPolicy::every_time(self.delay_before_command)
        } else if self.delay_before_first_command != Duration::ZERO {
            DelayPolicy::on_slave_change(self.delay_before_first_command)
        } else {
            DelayPolicy::NEVER
        }
    }
}
