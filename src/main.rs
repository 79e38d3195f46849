//! Process owner: parses the CLI, loads config, spawns one worker thread
//! per Modbus network plus the MQTT bus thread, and wires Ctrl+C to a clean
//! `EndWork` shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{error, info};

use modmqtt_bridge::bus::{BusObject, BusWorker};
use modmqtt_bridge::cli::Args;
use modmqtt_bridge::config;
use modmqtt_bridge::core::compiler::{self, PollFragment};
use modmqtt_bridge::core::messages::{FromNetwork, ToNetwork};
use modmqtt_bridge::core::register::RegisterRef;
use modmqtt_bridge::core::scheduler::PollSpec;
use modmqtt_bridge::core::worker::NetworkWorker;

fn main() {
    let args = Args::parse();

    env_logger::Builder::new().filter_level(args.log_level()).init();

    let cfg = match config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load {}: {err}", args.config.display());
            std::process::exit(1);
        }
    };

    if cfg.networks.is_empty() {
        error!("configuration declares no networks");
        std::process::exit(1);
    }

    let mut to_networks: HashMap<String, flume::Sender<ToNetwork>> = HashMap::new();
    let mut bus_networks: HashMap<String, (flume::Sender<ToNetwork>, flume::Receiver<FromNetwork>)> =
        HashMap::new();
    let mut handles = Vec::new();

    for network in &cfg.networks {
        let (to_tx, to_rx) = flume::unbounded::<ToNetwork>();
        let (from_tx, from_rx) = flume::unbounded::<FromNetwork>();

        let spec = compile_network_spec(&cfg.objects, &network.name);
        if to_tx.send(ToNetwork::Configure(network.clone())).is_err()
            || to_tx.send(ToNetwork::SetPollSpecification(spec)).is_err()
        {
            error!("failed to prime network `{}`", network.name);
            std::process::exit(1);
        }

        for (_, slave) in cfg.slaves.iter().filter(|(net, _)| net == &network.name) {
            if to_tx.send(ToNetwork::UpdateSlaveConfig(slave.clone())).is_err() {
                error!("failed to prime network `{}` with slave config", network.name);
                std::process::exit(1);
            }
        }

        let worker = NetworkWorker::new(network.name.clone(), to_rx, from_tx.clone());
        let name = network.name.clone();
        let handle = match std::thread::Builder::new()
            .name(format!("modbus-{name}"))
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                error!("failed to spawn worker thread for `{name}`: {err}");
                std::process::exit(1);
            }
        };

        to_networks.insert(network.name.clone(), to_tx.clone());
        bus_networks.insert(network.name.clone(), (to_tx, from_rx));
        handles.push(handle);
    }

    let bus = BusWorker::new(cfg.mqtt, cfg.objects, bus_networks);
    std::thread::spawn(move || bus.run());

    let shutdown_senders = Arc::new(Mutex::new(to_networks));
    let ctrlc_senders = shutdown_senders.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("received interrupt, shutting down");
        for sender in ctrlc_senders.lock().unwrap().values() {
            let _ = sender.send(ToNetwork::EndWork);
        }
    }) {
        error!("failed to install Ctrl+C handler: {err}");
    }

    for handle in handles {
        let _ = handle.join();
    }
}

fn compile_network_spec(objects: &[BusObject], network: &str) -> PollSpec {
    let fragments: Vec<PollFragment> = objects
        .iter()
        .filter(|o| o.network == network)
        .map(|o| PollFragment {
            register: RegisterRef {
                slave: o.slave,
                first_register: o.first_register,
                count: o.count,
                kind: o.kind,
            },
            refresh: o.refresh,
        })
        .collect();
    compiler::compile(fragments, true)
}
