use std::fmt;
use std::str::FromStr;

use structopt::StructOpt;

use crate::logging::Level;

/// Which process this invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Gateway,
    Manager,
    Dmb,
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gateway" => Ok(Role::Gateway),
            "manager" => Ok(Role::Manager),
            "dmb" => Ok(Role::Dmb),
            _ => Err(format!("unknown role {s:?}, expected gateway, manager or dmb")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Gateway => "gateway",
            Role::Manager => "manager",
            Role::Dmb => "dmb",
        };
        f.write_str(name)
    }
}

#[derive(StructOpt, Debug, Clone, Default)]
pub struct Options {
    /// Process role: gateway, manager or dmb
    #[structopt(name = "role", default_value = "gateway")]
    pub role: Role,

    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Host of the broker this process fronts (gateway), serves on (manager) or registers (dmb)
    #[structopt(name = "host", long)]
    pub host: Option<String>,

    /// Port belonging to --host
    #[structopt(name = "port", long)]
    pub port: Option<u16>,

    /// Control-plane broker host
    #[structopt(name = "manager-host", long)]
    pub manager_host: Option<String>,

    /// Control-plane broker port
    #[structopt(name = "manager-port", long)]
    pub manager_port: Option<u16>,

    /// Topic the registered broker takes over (dmb only), e.g. "/1/2"
    #[structopt(name = "topic", long)]
    pub topic: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[structopt(name = "log-level", long)]
    pub log_level: Option<Level>,
}
