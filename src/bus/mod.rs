//! MQTT bus worker: the other side of a network worker's channel pair,
//! translating bus-object topic configuration to subscriptions/publications
//! over a blocking `rumqttc` client on its own thread.

use std::collections::HashMap;
use std::time::Duration;

use flume::{Receiver, Sender};
use log::{debug, error, info, warn};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};

use crate::core::messages::{FromNetwork, ToNetwork};
use crate::core::register::{RegisterType, WriteValues};

#[derive(Debug, Clone)]
pub struct MqttBrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

/// One bus object: a named register block mapped onto a state topic (and,
/// for writable kinds, a command topic).
#[derive(Debug, Clone)]
pub struct BusObject {
    pub network: String,
    pub slave: u8,
    pub kind: RegisterType,
    pub first_register: u16,
    pub count: u16,
    pub refresh: Duration,
    pub state_topic: String,
    pub command_topic: Option<String>,
}

/// Wire payload published on a state topic / expected on a command topic —
/// deliberately plain so any MQTT client can drive the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub values: Vec<u16>,
}

pub struct BusWorker {
    broker: MqttBrokerConfig,
    objects: Vec<BusObject>,
    /// Per-network channel pair, so the bus worker can route a `FromNetwork`
    /// message to the right topic and a command-topic message to the right
    /// network's `ToNetwork::Write`.
    networks: HashMap<String, (Sender<ToNetwork>, Receiver<FromNetwork>)>,
}

impl BusWorker {
    pub fn new(
        broker: MqttBrokerConfig,
        objects: Vec<BusObject>,
        networks: HashMap<String, (Sender<ToNetwork>, Receiver<FromNetwork>)>,
    ) -> Self {
        Self {
            broker,
            objects,
            networks,
        }
    }

    pub fn run(self) {
        let mut options = MqttOptions::new(self.broker.client_id.clone(), self.broker.host.clone(), self.broker.port);
        options.set_keep_alive(self.broker.keep_alive);
        if let (Some(user), Some(pass)) = (&self.broker.username, &self.broker.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut connection) = Client::new(options, 64);

        for object in &self.objects {
            if let Some(topic) = &object.command_topic {
                if let Err(err) = client.subscribe(topic, QoS::AtLeastOnce) {
                    error!("mqtt: failed to subscribe to {topic}: {err}");
                }
            }
        }

        // The blocking `Connection` iterator and the per-network receivers
        // both need servicing; run the subscriber feed on this thread and
        // poll the network->bus direction from a companion thread so neither
        // starves the other.
        let publish_client = client.clone();
        let objects_for_publish = self.objects.clone();
        let networks_for_publish: Vec<(String, Receiver<FromNetwork>)> = self
            .networks
            .iter()
            .map(|(name, (_, rx))| (name.clone(), rx.clone()))
            .collect();
        std::thread::spawn(move || {
            publish_loop(publish_client, objects_for_publish, networks_for_publish);
        });

        let mut bus_up = false;
        for notification in connection.iter() {
            match notification {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if !bus_up {
                        bus_up = true;
                        self.broadcast_bus_state(true);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch_command(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt: connection error: {err}");
                    if bus_up {
                        bus_up = false;
                        self.broadcast_bus_state(false);
                    }
                }
            }
        }
        info!("mqtt: connection loop ended");
    }

    /// Every network worker waits for this before it starts polling hardware,
    /// so a down bus does not let outbound events pile up unbounded.
    fn broadcast_bus_state(&self, is_up: bool) {
        for (to_network, _) in self.networks.values() {
            let _ = to_network.send(ToNetwork::MqttNetworkState { is_up });
        }
    }

    fn dispatch_command(&self, topic: &str, payload: &[u8]) {
        let Some(object) = self.objects.iter().find(|o| o.command_topic.as_deref() == Some(topic)) else {
            return;
        };
        let parsed: RegisterPayload = match serde_json::from_slice(payload) {
            Ok(p) => p,
            Err(err) => {
                warn!("mqtt: malformed payload on {topic}: {err}");
                return;
            }
        };
        let Some((to_network, _)) = self.networks.get(&object.network) else {
            warn!("mqtt: command for unknown network {}", object.network);
            return;
        };
        let write = ToNetwork::Write(WriteValues {
            slave: object.slave,
            kind: object.kind,
            first_register: object.first_register,
            values: parsed.values,
        });
        if to_network.send(write).is_err() {
            warn!("mqtt: network {} channel closed", object.network);
        }
    }
}

fn publish_loop(client: Client, objects: Vec<BusObject>, networks: Vec<(String, Receiver<FromNetwork>)>) {
    loop {
        let mut any = false;
        for (name, rx) in &networks {
            while let Ok(msg) = rx.try_recv() {
                any = true;
                handle_outbound(&client, &objects, name, msg);
            }
        }
        if !any {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

fn handle_outbound(client: &Client, objects: &[BusObject], network: &str, msg: FromNetwork) {
    match msg {
        FromNetwork::RegisterValues {
            slave,
            kind,
            first_register,
            values,
        } => {
            if let Some(object) = find_object(objects, network, slave, kind, first_register) {
                publish_values(client, &object.state_topic, &values);
            }
        }
        FromNetwork::ReadFailed { slave, kind, first_register } => {
            debug!("{network}: read failed slave={slave} kind={kind:?} first_register={first_register}");
        }
        FromNetwork::WriteFailed { slave, kind, first_register } => {
            debug!("{network}: write failed slave={slave} kind={kind:?} first_register={first_register}");
        }
        FromNetwork::ModbusNetworkState { name, is_up } => {
            info!("{name}: link {}", if is_up { "up" } else { "down" });
        }
        FromNetwork::Backpressure { name, is_low } => {
            if is_low {
                info!("{name}: write queue back below the low watermark");
            } else {
                warn!("{name}: write queue above the high watermark, commands may be rejected");
            }
        }
    }
}

fn find_object<'a>(
    objects: &'a [BusObject],
    network: &str,
    slave: u8,
    kind: RegisterType,
    first_register: u16,
) -> Option<&'a BusObject> {
    objects.iter().find(|o| {
        o.network == network
            && o.slave == slave
            && o.kind == kind
            && first_register >= o.first_register
            && first_register < o.first_register + o.count
    })
}

fn publish_values(client: &Client, topic: &str, values: &[u16]) {
    let payload = RegisterPayload { values: values.to_vec() };
    match serde_json::to_vec(&payload) {
        Ok(bytes) => {
            if let Err(err) = client.publish(topic, QoS::AtLeastOnce, false, bytes) {
                warn!("mqtt: publish to {topic} failed: {err}");
            }
        }
        Err(err) => error!("mqtt: failed to serialize payload for {topic}: {err}"),
    }
}
