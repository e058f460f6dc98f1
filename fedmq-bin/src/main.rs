#![deny(unsafe_code)]

use std::process;
use std::sync::Arc;

use fedmq::dmb::Registrar;
use fedmq::gateway::Gateway;
use fedmq::logger::logger_init;
use fedmq::manager::Manager;
use fedmq::settings::{Options, Role, Settings};
use fedmq::transport::MqttConnector;
use fedmq::{log, structopt::StructOpt, tokio, Result};

#[tokio::main]
async fn main() {
    //init config
    let cfg = Settings::init(Options::from_args()).expect("settings init failed");

    //init log
    let guard = logger_init(&cfg.log).expect("logger init failed");

    Settings::logs();

    if let Err(e) = serve(cfg).await {
        log::error!("{} stopped, {}", cfg.opts.role, e);
        drop(guard);
        process::exit(1);
    }
}

async fn serve(cfg: &'static Settings) -> Result<()> {
    let connector = Arc::new(MqttConnector::new(cfg.transport.clone())?);
    let capacity = cfg.transport.channel_capacity;
    match cfg.opts.role {
        Role::Gateway => {
            let mut gateway = Gateway::connect(cfg.gateway.clone(), connector, capacity).await?;
            gateway.run(shutdown_signal()).await
        }
        Role::Manager => {
            let mut manager = Manager::connect(cfg.manager.clone(), connector, capacity).await?;
            manager.run(shutdown_signal()).await
        }
        Role::Dmb => {
            let mut registrar = Registrar::connect(cfg.dmb.clone(), connector, capacity).await?;
            if !registrar.run(shutdown_signal()).await? {
                log::info!("interrupted before {} was registered", registrar.entry().broker_info);
            }
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("listen for ctrl-c failed, {}", e);
        std::future::pending::<()>().await;
    }
}
