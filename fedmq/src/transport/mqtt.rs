use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::mpsc::error::TrySendError;

use fedmq_conf::TransportConfig;

use crate::transport::{Connector, Transport};
use crate::types::{Endpoint, Message, QoS, Tx};
use crate::{FedError, Result};

#[inline]
fn mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Opens MQTT v3.1.1 client connections.
pub struct MqttConnector {
    cfg: TransportConfig,
    qos: QoS,
    seq: AtomicUsize,
}

impl MqttConnector {
    pub fn new(cfg: TransportConfig) -> Result<Self> {
        let qos = QoS::try_from(cfg.qos)?;
        Ok(Self { cfg, qos, seq: AtomicUsize::new(0) })
    }

    fn client_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.cfg.client_id_prefix,
            std::process::id(),
            self.seq.fetch_add(1, Ordering::SeqCst)
        )
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, endpoint: &Endpoint, inbound: Tx) -> Result<Box<dyn Transport>> {
        let client_id = self.client_id();
        let mut opts = MqttOptions::new(client_id.clone(), endpoint.host.clone(), endpoint.port);
        opts.set_keep_alive(self.cfg.keepalive);
        opts.set_clean_session(true);
        let max_packet_size = self.cfg.max_packet_size.as_usize();
        opts.set_max_packet_size(max_packet_size, max_packet_size);

        let (client, mut eventloop) = AsyncClient::new(opts, self.cfg.channel_capacity);
        tokio::time::timeout(self.cfg.connect_timeout, wait_connack(&mut eventloop))
            .await
            .map_err(|_| FedError::Timeout(self.cfg.connect_timeout))??;
        log::info!("{client_id} connected to {endpoint}");

        let closed = Arc::new(AtomicBool::new(false));
        let subscriptions = Arc::new(Mutex::new(BTreeSet::new()));
        tokio::spawn(drive(
            endpoint.clone(),
            client.clone(),
            eventloop,
            inbound,
            closed.clone(),
            subscriptions.clone(),
            self.qos,
            self.cfg.reconnect_interval,
        ));

        Ok(Box::new(MqttTransport { endpoint: endpoint.clone(), client, qos: self.qos, closed, subscriptions }))
    }
}

async fn wait_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
            if ack.code == ConnectReturnCode::Success {
                return Ok(());
            }
            return Err(FedError::Transport(format!("connection refused, {:?}", ack.code)));
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    endpoint: Endpoint,
    client: AsyncClient,
    mut eventloop: EventLoop,
    inbound: Tx,
    closed: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    qos: QoS,
    reconnect_interval: Duration,
) {
    let mut reconnecting = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let msg = Message { topic: p.topic, payload: p.payload, retain: p.retain };
                if !forward_inbound(&inbound, msg, &endpoint) {
                    log::debug!("inbound channel of {endpoint} closed");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) if reconnecting => {
                reconnecting = false;
                //clean session, the broker forgot every subscription
                let topics: Vec<String> = subscriptions.lock().iter().cloned().collect();
                log::info!("reconnected to {endpoint}, restoring {} subscriptions", topics.len());
                for topic in topics {
                    if let Err(e) = client.try_subscribe(topic.clone(), mqtt_qos(qos)) {
                        log::warn!("resubscribe {topic} on {endpoint} failed, {e}");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                log::debug!("disconnected from {endpoint}");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("connection to {endpoint} lost, {e}, retry in {reconnect_interval:?}");
                reconnecting = true;
                tokio::time::sleep(reconnect_interval).await;
            }
        }
    }
}

//Never waits on the consumer: it may itself be blocked on this connection's request queue,
//which only drains while the event loop keeps polling. Returns false once the consumer is gone.
fn forward_inbound(inbound: &Tx, msg: Message, endpoint: &Endpoint) -> bool {
    match inbound.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            log::warn!("inbound channel of {endpoint} full, dropping message on {}", msg.topic);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

struct MqttTransport {
    endpoint: Endpoint,
    client: AsyncClient,
    qos: QoS,
    closed: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
}

#[async_trait]
impl Transport for MqttTransport {
    #[inline]
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        self.client.publish_bytes(topic, mqtt_qos(self.qos), retain, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client.subscribe(topic, mqtt_qos(self.qos)).await?;
        self.subscriptions.lock().insert(topic.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions.lock().remove(topic);
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn disconnect(&self, quiesce: Duration) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        match tokio::time::timeout(quiesce, self.client.disconnect()).await {
            Ok(res) => res?,
            Err(_) => log::warn!("disconnect from {} not flushed within {:?}", self.endpoint, quiesce),
        }
        Ok(())
    }
}
