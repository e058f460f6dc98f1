use std::convert::TryFrom;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::FedError;

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

pub type Tx = mpsc::Sender<Message>;
pub type Rx = mpsc::Receiver<Message>;

/// tool -> manager, request to add a distributed broker
pub const TOPIC_BROKER_ADD: &str = "/api/tool/distributedbroker/add";
/// manager -> gateways, retained full broker table
pub const TOPIC_BROKER_TABLE: &str = "/api/brokertable/all/info";
/// gateway -> manager, status report
pub const TOPIC_GATEWAY_NOTICE: &str = "/api/notice/gatewaybroker";
/// manager -> gateways, `complete` once every gateway converged
pub const TOPIC_UPDATE_STATUS: &str = "/api/brokertable/update/status";
/// tool -> manager, extra coverage area for a gateway
pub const TOPIC_GATEWAY_SET: &str = "/api/tool/gatewaybroker/set";
/// manager -> everyone, retained coverage map
pub const TOPIC_GATEWAY_INFO: &str = "/api/gateway/info/all";

pub const TOPIC_REGISTER: &str = "/api/register";
pub const TOPIC_UNREGISTER: &str = "/api/unregister";
pub const TOPIC_FORWARD: &str = "/forward";

pub const STATUS_COMPLETE: &str = "complete";

/// Version of a broker table that has never accepted an addition.
pub const INITIAL_VERSION: i64 = -1;

/// Address of a broker, serialized as `{"host":..,"port":..}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    #[inline]
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Endpoint { host: host.into(), port }
    }

    /// Gateway identity used by the manager, `host-port`.
    #[inline]
    pub fn key(&self) -> String {
        format!("{}-{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QoS {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = FedError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(FedError::Msg(format!("invalid qos {v}"))),
        }
    }
}

/// A message received from, or destined to, a broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl Message {
    #[inline]
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Message { topic: topic.into(), payload: payload.into(), retain: false }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedBrokerInfo {
    pub topic: String,
    pub broker_info: Endpoint,
}

impl DistributedBrokerInfo {
    #[inline]
    pub fn new<T: Into<String>>(topic: T, broker_info: Endpoint) -> Self {
        DistributedBrokerInfo { topic: topic.into(), broker_info }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllDistributedBrokerInfo {
    pub version: i64,
    pub brokers: Vec<DistributedBrokerInfo>,
}

impl Default for AllDistributedBrokerInfo {
    fn default() -> Self {
        AllDistributedBrokerInfo { version: INITIAL_VERSION, brokers: Vec::new() }
    }
}

impl AllDistributedBrokerInfo {
    #[inline]
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.brokers.iter().any(|b| &b.broker_info == endpoint)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Complete,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Up => f.write_str("up"),
            Status::Complete => f.write_str(STATUS_COMPLETE),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub broker_info: Endpoint,
    pub status: Status,
    pub version: i64,
}

/// One coverage area of a gateway; also the payload of a coverage assignment request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCoverArea {
    pub topic: String,
    pub broker_info: Endpoint,
}
