//! Command executor: the part of the worker that actually talks to
//! the transport, tracking the last transaction's time and target slave so
//! the queues can evaluate `DelayPolicy::required_silence` before the next
//! one.

use std::time::{Duration, Instant};

use super::messages::FromNetwork;
use super::queues::PollCommand;
use super::register::{RegisterWrite, SlaveAddress};
use super::scheduler::Scheduler;
use crate::transport::Transport;

pub struct Executor {
    last_command_at: Option<Instant>,
    last_slave: Option<SlaveAddress>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            last_command_at: None,
            last_slave: None,
        }
    }

    /// Time elapsed since the last transaction was put on the wire.
    /// `Duration::MAX` before the first one, so no `DelayPolicy` blocks it.
    pub fn elapsed_since_last(&self, now: Instant) -> Duration {
        match self.last_command_at {
            None => Duration::MAX,
            Some(last) => now.saturating_duration_since(last),
        }
    }

    pub fn last_slave(&self) -> Option<SlaveAddress> {
        self.last_slave
    }

    /// Reconnect resets the silence clock: the first command on a fresh link
    /// must not benefit from silence accrued while disconnected.
    pub fn reset(&mut self) {
        self.last_command_at = None;
        self.last_slave = None;
    }

    pub fn execute_poll(
        &mut self,
        transport: &mut dyn Transport,
        scheduler: &mut Scheduler,
        cmd: PollCommand,
        now: Instant,
    ) -> FromNetwork {
        let PollCommand { slave, register, .. } = cmd;
        let result = transport.read_block(slave, register.kind, register.first_register, register.count);
        self.last_command_at = Some(now);
        self.last_slave = Some(slave);

        match result {
            Ok(values) => {
                scheduler.mark_read(&register, now);
                FromNetwork::RegisterValues {
                    slave,
                    kind: register.kind,
                    first_register: register.first_register,
                    values,
                }
            }
            // No `mark_read`: a failed poll stays due so it is retried on the
            // next schedule pass rather than waiting a full refresh period.
            Err(_) => FromNetwork::ReadFailed {
                slave,
                kind: register.kind,
                first_register: register.first_register,
            },
        }
    }

    /// Writes are never retried: the queue already dropped the command by
    /// the time this returns, success or failure.
    pub fn execute_write(
        &mut self,
        transport: &mut dyn Transport,
        write: RegisterWrite,
        now: Instant,
    ) -> Vec<FromNetwork> {
        let RegisterWrite { target, values, echo, .. } = write;
        let result = transport.write_block(target.slave, target.kind, target.first_register, &values);
        self.last_command_at = Some(now);
        self.last_slave = Some(target.slave);

        match result {
            Ok(()) => echo
                .into_iter()
                .map(|e| FromNetwork::RegisterValues {
                    slave: e.slave,
                    kind: e.kind,
                    first_register: e.first_register,
                    values: e.values,
                })
                .collect(),
            Err(_) => vec![FromNetwork::WriteFailed {
                slave: target.slave,
                kind: target.kind,
                first_register: target.first_register,
            }],
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}
