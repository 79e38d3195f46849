//! Network worker: one OS thread per fieldbus network running a
//! small state machine — `NoConfig -> Disconnected -> Connected` — with
//! exponential backoff on reconnect.

use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};

use super::executor::Executor;
use super::messages::{FromNetwork, ToNetwork};
use super::queues::{rejects_register_type, QueuedCommand, RequestQueues, DEFAULT_MAX_WRITE_QUEUE_SIZE};
use super::register::{NetworkConfig, NetworkTransportConfig, RegisterRef, RegisterWrite, SlaveAddress, WriteValues};
use super::scheduler::Scheduler;
use crate::transport::rtu::RtuTransport;
use crate::transport::tcp::TcpTransport;
use crate::transport::Transport;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NoConfig,
    Disconnected,
    Connected,
}

pub struct NetworkWorker {
    name: String,
    from_process: Receiver<ToNetwork>,
    to_process: Sender<FromNetwork>,
    config: Option<NetworkConfig>,
    transport: Option<Box<dyn Transport>>,
    scheduler: Scheduler,
    queues: RequestQueues,
    executor: Executor,
    slave_overrides: std::collections::HashMap<SlaveAddress, super::register::DelayPolicy>,
    state: State,
    backoff: Duration,
    last_reported_usage_low: bool,
    /// Whether the MQTT bus side is currently reachable. Starts `false`:
    /// the bridge should not flood the poll queue before the bus worker has
    /// confirmed a broker connection.
    bus_connected: bool,
}

impl NetworkWorker {
    pub fn new(name: String, from_process: Receiver<ToNetwork>, to_process: Sender<FromNetwork>) -> Self {
        Self {
            name,
            from_process,
            to_process,
            config: None,
            transport: None,
            scheduler: Scheduler::new(),
            queues: RequestQueues::new(DEFAULT_MAX_WRITE_QUEUE_SIZE),
            executor: Executor::new(),
            slave_overrides: Default::default(),
            state: State::NoConfig,
            backoff: Duration::ZERO,
            last_reported_usage_low: true,
            bus_connected: false,
        }
    }

    /// Drives the state machine until `EndWork` or the channel closes.
    pub fn run(mut self) {
        loop {
            let keep_going = match self.state {
                State::NoConfig => self.wait_for_configure(),
                State::Disconnected => self.try_connect(),
                State::Connected => self.iterate_connected(),
            };
            if !keep_going {
                debug!("{}: worker stopping", self.name);
                return;
            }
        }
    }

    fn wait_for_configure(&mut self) -> bool {
        match self.from_process.recv() {
            Ok(msg) => self.handle_message(msg),
            Err(_) => false,
        }
    }

    fn try_connect(&mut self) -> bool {
        if !self.drain_pending() {
            return false;
        }
        if self.state != State::Disconnected {
            return true;
        }

        let Some(config) = self.config.clone() else {
            self.state = State::NoConfig;
            return true;
        };

        let Some(mut transport) = build_transport(&config) else {
            error!("{}: invalid transport configuration", self.name);
            self.state = State::NoConfig;
            return true;
        };

        match transport.connect() {
            Ok(()) => {
                info!("{}: connected", self.name);
                self.transport = Some(transport);
                self.scheduler.reset_epoch();
                self.executor.reset();
                self.backoff = Duration::ZERO;
                self.state = State::Connected;
                self.report(FromNetwork::ModbusNetworkState {
                    name: self.name.clone(),
                    is_up: true,
                });
                true
            }
            Err(err) => {
                warn!("{}: connect failed: {err}", self.name);
                let wait = if self.backoff.is_zero() { INITIAL_BACKOFF } else { self.backoff };
                self.backoff = (wait * 2).min(MAX_BACKOFF);
                match self.from_process.recv_timeout(wait) {
                    Ok(msg) => self.handle_message(msg),
                    Err(RecvTimeoutError::Timeout) => true,
                    Err(RecvTimeoutError::Disconnected) => false,
                }
            }
        }
    }

    fn iterate_connected(&mut self) -> bool {
        if !self.drain_pending() {
            return false;
        }
        if self.state != State::Connected {
            return true;
        }

        let Some(config) = self.config.clone() else {
            self.state = State::NoConfig;
            return true;
        };

        if !self.bus_connected {
            return match self.from_process.recv() {
                Ok(msg) => self.handle_message(msg),
                Err(_) => false,
            };
        }

        let now = Instant::now();
        let (due, sleep_hint) = self.scheduler.get_registers_to_poll(now);
        if !due.is_empty() {
            let default_policy = config.default_delay_policy();
            let mut flat = Vec::new();
            for (slave, registers) in due {
                let policy = self.slave_overrides.get(&slave).copied().unwrap_or(default_policy);
                for register in registers {
                    flat.push((slave, register, policy));
                }
            }
            self.queues.refill_polls(flat);
        }

        if self.queues.is_empty() {
            let wait = sleep_hint.min(IDLE_POLL_INTERVAL);
            return match self.from_process.recv_timeout(wait) {
                Ok(msg) => self.handle_message(msg),
                Err(RecvTimeoutError::Timeout) => true,
                Err(RecvTimeoutError::Disconnected) => false,
            };
        }

        let elapsed = self.executor.elapsed_since_last(now);
        let last_slave = self.executor.last_slave();
        let overrides = &self.slave_overrides;
        let cmd = self
            .queues
            .pop_first_with_silence(elapsed, last_slave, |slave| overrides.get(&slave).copied());

        let Some(cmd) = cmd else {
            let missing = self
                .queues
                .min_missing_silence(elapsed, last_slave, |slave| overrides.get(&slave).copied())
                .unwrap_or(Duration::from_millis(10));
            std::thread::sleep(missing.min(IDLE_POLL_INTERVAL));
            return true;
        };

        let Some(transport) = self.transport.as_deref_mut() else {
            self.state = State::Disconnected;
            return true;
        };
        let exec_now = Instant::now();
        match cmd {
            QueuedCommand::Poll(p) => {
                let msg = self.executor.execute_poll(transport, &mut self.scheduler, p, exec_now);
                self.note_connection_loss(&msg);
                self.report(msg);
            }
            QueuedCommand::Write(w) => {
                let msgs = self.executor.execute_write(transport, w, exec_now);
                for msg in msgs {
                    self.note_connection_loss(&msg);
                    self.report(msg);
                }
                self.report_watermark();
            }
        }
        true
    }

    /// Drain every already-buffered message without blocking. Returns
    /// `false` on `EndWork` or a disconnected channel.
    fn drain_pending(&mut self) -> bool {
        loop {
            match self.from_process.try_recv() {
                Ok(msg) => {
                    if !self.handle_message(msg) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_message(&mut self, msg: ToNetwork) -> bool {
        match msg {
            ToNetwork::Configure(cfg) => {
                debug!("{}: reconfigured", self.name);
                self.config = Some(cfg);
                self.disconnect_transport();
                self.state = State::Disconnected;
            }
            ToNetwork::SetPollSpecification(spec) => {
                self.scheduler.set_spec(spec);
            }
            ToNetwork::Write(values) => self.enqueue_write(values),
            ToNetwork::UpdateSlaveConfig(cfg) => {
                self.slave_overrides.insert(cfg.address, cfg.delay_before_command);
            }
            ToNetwork::MqttNetworkState { is_up } => {
                self.bus_connected = is_up;
            }
            ToNetwork::EndWork => {
                self.disconnect_transport();
                return false;
            }
        }
        true
    }

    fn enqueue_write(&mut self, write: WriteValues) {
        if rejects_register_type(write.kind) {
            self.report(FromNetwork::WriteFailed {
                slave: write.slave,
                kind: write.kind,
                first_register: write.first_register,
            });
            return;
        }

        let target = RegisterRef {
            slave: write.slave,
            first_register: write.first_register,
            count: write.values.len() as u16,
            kind: write.kind,
        };
        let echo = self.scheduler.find_register_poll(&target).map(|_| write.clone());
        let delay = self
            .config
            .as_ref()
            .map(|c| c.default_delay_policy())
            .unwrap_or(super::register::DelayPolicy::NEVER);
        let request = RegisterWrite {
            target,
            values: write.values,
            echo,
            delay,
        };

        if let Err(overflow) = self.queues.enqueue_write(request) {
            warn!(
                "{}: write queue full, dropping newest write to slave {}",
                self.name, overflow.rejected.target.slave
            );
            self.report(FromNetwork::WriteFailed {
                slave: overflow.rejected.target.slave,
                kind: overflow.rejected.target.kind,
                first_register: overflow.rejected.target.first_register,
            });
        }
        self.report_watermark();
    }

    /// Report a watermark crossing exactly once per transition, matching the
    /// hysteresis: `usage_low` stays true until the high watermark is hit,
    /// then stays false until the low watermark is hit again.
    fn report_watermark(&mut self) {
        let is_low = self.queues.usage_low();
        if is_low != self.last_reported_usage_low {
            self.last_reported_usage_low = is_low;
            self.report(FromNetwork::Backpressure {
                name: self.name.clone(),
                is_low,
            });
        }
    }

    fn disconnect_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
            self.report(FromNetwork::ModbusNetworkState {
                name: self.name.clone(),
                is_up: false,
            });
        }
    }

    /// A retryable transport error during a live connection means the link
    /// actually dropped; fall back to `Disconnected` so the backoff/reconnect
    /// cycle takes over instead of spinning on every scheduled poll.
    fn note_connection_loss(&mut self, msg: &FromNetwork) {
        if matches!(msg, FromNetwork::ReadFailed { .. } | FromNetwork::WriteFailed { .. })
            && self.transport.as_ref().map(|t| !t.is_connected()).unwrap_or(false)
        {
            self.disconnect_transport();
            self.state = State::Disconnected;
        }
    }

    fn report(&self, msg: FromNetwork) {
        if self.to_process.send(msg).is_err() {
            warn!("{}: outbound channel closed, dropping message", self.name);
        }
    }
}

fn build_transport(config: &NetworkConfig) -> Option<Box<dyn Transport>> {
    match &config.transport {
        NetworkTransportConfig::Rtu { .. } => {
            RtuTransport::from_config(&config.transport, config.response_timeout)
                .map(|t| Box::new(t) as Box<dyn Transport>)
        }
        NetworkTransportConfig::Tcp { .. } => {
            TcpTransport::from_config(&config.transport, config.response_timeout)
                .map(|t| Box::new(t) as Box<dyn Transport>)
        }
    }
}
