#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use fedmq_utils::*;

use self::logging::Log;

pub use self::options::{Options, Role};

pub mod logging;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub dmb: DmbConfig,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/fedmq/fedmq").required(false))
            .add_source(File::with_name("fedmq").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("fedmq").prefix_separator("_").separator("__").try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        inner.apply(&opts);
        inner.validate()?;

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() {
        let cfg = Self::instance();
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("role is {}", cfg.opts.role);
        log::info!("transport config is: {:?}", cfg.transport);
        match cfg.opts.role {
            Role::Gateway => log::info!("gateway config is: {:?}", cfg.gateway),
            Role::Manager => log::info!("manager config is: {:?}", cfg.manager),
            Role::Dmb => log::info!("dmb config is: {:?}", cfg.dmb),
        }
    }
}

impl Inner {
    fn apply(&mut self, opts: &Options) {
        if let Some(level) = opts.log_level {
            self.log.level = level;
        }
        match opts.role {
            Role::Gateway => {
                if let Some(host) = opts.host.as_ref() {
                    self.gateway.host.clone_from(host);
                }
                if let Some(port) = opts.port {
                    self.gateway.port = port;
                }
                if let Some(host) = opts.manager_host.as_ref() {
                    self.gateway.manager_host.clone_from(host);
                }
                if let Some(port) = opts.manager_port {
                    self.gateway.manager_port = port;
                }
            }
            Role::Manager => {
                if let Some(host) = opts.host.as_ref().or(opts.manager_host.as_ref()) {
                    self.manager.host.clone_from(host);
                }
                if let Some(port) = opts.port.or(opts.manager_port) {
                    self.manager.port = port;
                }
            }
            Role::Dmb => {
                if let Some(host) = opts.host.as_ref() {
                    self.dmb.host.clone_from(host);
                }
                if let Some(port) = opts.port {
                    self.dmb.port = port;
                }
                if let Some(host) = opts.manager_host.as_ref() {
                    self.dmb.manager_host.clone_from(host);
                }
                if let Some(port) = opts.manager_port {
                    self.dmb.manager_port = port;
                }
                if let Some(topic) = opts.topic.as_ref() {
                    self.dmb.topic.clone_from(topic);
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.transport.qos > 2 {
            return Err(anyhow!("transport.qos must be 0, 1 or 2, got {}", self.transport.qos));
        }
        if self.transport.channel_capacity == 0 {
            return Err(anyhow!("transport.channel_capacity must be greater than 0"));
        }
        if self.dmb.retry_multiplier < 1.0 {
            return Err(anyhow!("dmb.retry_multiplier must be at least 1.0"));
        }
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

/// Client side settings used for every backend, front-end and control-plane connection.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "TransportConfig::client_id_prefix_default")]
    pub client_id_prefix: String,
    #[serde(default = "TransportConfig::keepalive_default", deserialize_with = "deserialize_duration")]
    pub keepalive: Duration,
    #[serde(default = "TransportConfig::connect_timeout_default", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    #[serde(default = "TransportConfig::reconnect_interval_default", deserialize_with = "deserialize_duration")]
    pub reconnect_interval: Duration,
    #[serde(default = "TransportConfig::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    //Capacity of the request queue and of inbound message channels.
    #[serde(default = "TransportConfig::channel_capacity_default")]
    pub channel_capacity: usize,
    #[serde(default = "TransportConfig::qos_default")]
    pub qos: u8,
}

impl Default for TransportConfig {
    #[inline]
    fn default() -> Self {
        Self {
            client_id_prefix: Self::client_id_prefix_default(),
            keepalive: Self::keepalive_default(),
            connect_timeout: Self::connect_timeout_default(),
            reconnect_interval: Self::reconnect_interval_default(),
            max_packet_size: Self::max_packet_size_default(),
            channel_capacity: Self::channel_capacity_default(),
            qos: Self::qos_default(),
        }
    }
}

impl TransportConfig {
    fn client_id_prefix_default() -> String {
        "fedmq".into()
    }
    fn keepalive_default() -> Duration {
        Duration::from_secs(60)
    }
    fn connect_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn reconnect_interval_default() -> Duration {
        Duration::from_secs(3)
    }
    fn max_packet_size_default() -> Bytesize {
        Bytesize::from("1M")
    }
    fn channel_capacity_default() -> usize {
        1000
    }
    fn qos_default() -> u8 {
        1
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    //Front-end broker, also the identity reported to the manager
    #[serde(default = "GatewayConfig::host_default")]
    pub host: String,
    #[serde(default = "GatewayConfig::port_default")]
    pub port: u16,
    #[serde(default = "GatewayConfig::host_default")]
    pub manager_host: String,
    #[serde(default = "GatewayConfig::manager_port_default")]
    pub manager_port: u16,
    #[serde(default = "GatewayConfig::idle_check_interval_default", deserialize_with = "deserialize_duration")]
    pub idle_check_interval: Duration,
    #[serde(default = "GatewayConfig::idle_timeout_default", deserialize_with = "deserialize_duration")]
    pub idle_timeout: Duration,
    #[serde(default = "GatewayConfig::quiesce_default", deserialize_with = "deserialize_duration")]
    pub quiesce: Duration,
    #[serde(default = "GatewayConfig::stats_interval_default", deserialize_with = "deserialize_duration")]
    pub stats_interval: Duration,
    #[serde(
        default = "GatewayConfig::migration_alert_interval_default",
        deserialize_with = "deserialize_duration"
    )]
    pub migration_alert_interval: Duration,
}

impl Default for GatewayConfig {
    #[inline]
    fn default() -> Self {
        Self {
            host: Self::host_default(),
            port: Self::port_default(),
            manager_host: Self::host_default(),
            manager_port: Self::manager_port_default(),
            idle_check_interval: Self::idle_check_interval_default(),
            idle_timeout: Self::idle_timeout_default(),
            quiesce: Self::quiesce_default(),
            stats_interval: Self::stats_interval_default(),
            migration_alert_interval: Self::migration_alert_interval_default(),
        }
    }
}

impl GatewayConfig {
    fn host_default() -> String {
        "localhost".into()
    }
    fn port_default() -> u16 {
        1884
    }
    fn manager_port_default() -> u16 {
        1883
    }
    fn idle_check_interval_default() -> Duration {
        Duration::from_secs(30)
    }
    fn idle_timeout_default() -> Duration {
        Duration::from_secs(300)
    }
    fn quiesce_default() -> Duration {
        Duration::from_millis(100)
    }
    fn stats_interval_default() -> Duration {
        Duration::from_secs(60)
    }
    fn migration_alert_interval_default() -> Duration {
        Duration::from_secs(30)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    //Control-plane bus
    #[serde(default = "ManagerConfig::host_default")]
    pub host: String,
    #[serde(default = "ManagerConfig::port_default")]
    pub port: u16,
    #[serde(default = "ManagerConfig::check_interval_default", deserialize_with = "deserialize_duration")]
    pub check_interval: Duration,
    //A migration not acknowledged by every gateway within this window is reported as stalled.
    #[serde(default = "ManagerConfig::migration_timeout_default", deserialize_with = "deserialize_duration")]
    pub migration_timeout: Duration,
    #[serde(default = "ManagerConfig::max_rebroadcasts_default")]
    pub max_rebroadcasts: usize,
}

impl Default for ManagerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            host: Self::host_default(),
            port: Self::port_default(),
            check_interval: Self::check_interval_default(),
            migration_timeout: Self::migration_timeout_default(),
            max_rebroadcasts: Self::max_rebroadcasts_default(),
        }
    }
}

impl ManagerConfig {
    fn host_default() -> String {
        "127.0.0.1".into()
    }
    fn port_default() -> u16 {
        1883
    }
    fn check_interval_default() -> Duration {
        Duration::from_secs(10)
    }
    fn migration_timeout_default() -> Duration {
        Duration::from_secs(120)
    }
    fn max_rebroadcasts_default() -> usize {
        3
    }
}

/// Distributed broker registrar.
#[derive(Debug, Clone, Deserialize)]
pub struct DmbConfig {
    #[serde(default = "DmbConfig::host_default")]
    pub manager_host: String,
    #[serde(default = "DmbConfig::manager_port_default")]
    pub manager_port: u16,
    #[serde(default = "DmbConfig::host_default")]
    pub host: String,
    #[serde(default = "DmbConfig::port_default")]
    pub port: u16,
    #[serde(default = "DmbConfig::topic_default")]
    pub topic: String,
    #[serde(default = "DmbConfig::retry_initial_default", deserialize_with = "deserialize_duration")]
    pub retry_initial: Duration,
    #[serde(default = "DmbConfig::retry_max_default", deserialize_with = "deserialize_duration")]
    pub retry_max: Duration,
    #[serde(default = "DmbConfig::retry_multiplier_default")]
    pub retry_multiplier: f64,
}

impl Default for DmbConfig {
    #[inline]
    fn default() -> Self {
        Self {
            manager_host: Self::host_default(),
            manager_port: Self::manager_port_default(),
            host: Self::host_default(),
            port: Self::port_default(),
            topic: Self::topic_default(),
            retry_initial: Self::retry_initial_default(),
            retry_max: Self::retry_max_default(),
            retry_multiplier: Self::retry_multiplier_default(),
        }
    }
}

impl DmbConfig {
    fn host_default() -> String {
        "localhost".into()
    }
    fn manager_port_default() -> u16 {
        1883
    }
    fn port_default() -> u16 {
        1885
    }
    fn topic_default() -> String {
        "/".into()
    }
    fn retry_initial_default() -> Duration {
        Duration::from_secs(1)
    }
    fn retry_max_default() -> Duration {
        Duration::from_secs(30)
    }
    fn retry_multiplier_default() -> f64 {
        2.0
    }
}
