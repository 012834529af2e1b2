use crate::maintainer::DEFAULT_ADB_DAEMON_PORT;
use anyhow::{Context, bail};
use common::Environment;
use common::config::{env_flag_or, env_opt, env_or, env_parse_or};
use std::str::FromStr;
use std::time::Duration;
use vsoc::Side;

/// Which end of the channel this process drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listens on local ports and opens connections to the guest
    Host,
    /// Accepts connections and dials local services
    Guest,
}

impl Role {
    pub fn side(self) -> Side {
        match self {
            Role::Host => Side::Host,
            Role::Guest => Side::Guest,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "host" => Ok(Role::Host),
            "guest" => Ok(Role::Guest),
            other => bail!("Unknown proxy role {:?}, expected host or guest", other),
        }
    }
}

/// A host listening port and the guest port its clients are forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub guest_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub environment: Environment,
    pub role: Role,
    pub shm_path: String,
    /// Only populated for the host role
    pub ports: Vec<PortPair>,
    pub maintain_adb_connections: bool,
    pub adb_daemon_port: u16,
    pub service_host: String,
    pub dial_retry_interval: Duration,
    pub otel_endpoint: Option<String>,
}

impl ProxyConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let role: Role = env_or("PROXY_ROLE", "host").parse()?;
        let ports = match role {
            Role::Host => parse_port_pairs(&env_or("GUEST_PORTS", ""), &env_or("HOST_PORTS", ""))?,
            Role::Guest => Vec::new(),
        };

        Ok(Self {
            environment: Environment::from_env(),
            role,
            shm_path: env_or("VSOC_SHM_PATH", vsoc::paths::SHARED_MEMORY_PATH),
            ports,
            maintain_adb_connections: env_flag_or("MAINTAIN_ADB_CONNECTIONS", true)?,
            adb_daemon_port: env_parse_or("ADB_DAEMON_PORT", DEFAULT_ADB_DAEMON_PORT)?,
            service_host: env_or("GUEST_SERVICE_HOST", "127.0.0.1"),
            dial_retry_interval: Duration::from_millis(env_parse_or("DIAL_RETRY_INTERVAL_MS", 1000)?),
            otel_endpoint: env_opt("OTEL_ENDPOINT"),
        })
    }
}

/// Pair two comma separated port lists position by position.
pub fn parse_port_pairs(guest_ports: &str, host_ports: &str) -> anyhow::Result<Vec<PortPair>> {
    let guest = parse_port_list(guest_ports).context("Invalid GUEST_PORTS")?;
    let host = parse_port_list(host_ports).context("Invalid HOST_PORTS")?;
    if guest.len() != host.len() {
        bail!(
            "GUEST_PORTS and HOST_PORTS must have the same length ({} vs {})",
            guest.len(),
            host.len()
        );
    }
    Ok(guest
        .into_iter()
        .zip(host)
        .map(|(guest_port, host_port)| PortPair {
            guest_port,
            host_port,
        })
        .collect())
}

fn parse_port_list(list: &str) -> anyhow::Result<Vec<u16>> {
    if list.trim().is_empty() {
        bail!("at least one port is required");
    }
    list.split(',')
        .map(|entry| -> anyhow::Result<u16> {
            let port: u16 = entry
                .trim()
                .parse()
                .with_context(|| format!("{:?} is not a port number", entry.trim()))?;
            if port == 0 {
                bail!("port 0 is not allowed");
            }
            Ok(port)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn set(key: &str, value: &str) {
        unsafe { env::set_var(key, value) };
    }

    fn unset(key: &str) {
        unsafe { env::remove_var(key) };
    }

    const KEYS: [&str; 6] = [
        "PROXY_ROLE",
        "GUEST_PORTS",
        "HOST_PORTS",
        "MAINTAIN_ADB_CONNECTIONS",
        "ADB_DAEMON_PORT",
        "DIAL_RETRY_INTERVAL_MS",
    ];

    fn clear() {
        for key in KEYS {
            unset(key);
        }
    }

    #[test]
    fn test_parse_port_pairs() {
        let pairs = parse_port_pairs("5000, 5555", "6000,6520").unwrap();
        assert_eq!(
            pairs,
            vec![
                PortPair {
                    guest_port: 5000,
                    host_port: 6000
                },
                PortPair {
                    guest_port: 5555,
                    host_port: 6520
                },
            ]
        );
    }

    #[test]
    fn test_parse_port_pairs_rejects_bad_lists() {
        assert!(parse_port_pairs("5000,5001", "6000").is_err(), "length mismatch");
        assert!(parse_port_pairs("", "").is_err(), "empty lists");
        assert!(parse_port_pairs("5000", "sixty").is_err(), "not a number");
        assert!(parse_port_pairs("70000", "6000").is_err(), "out of range");
        assert!(parse_port_pairs("0", "6000").is_err(), "port zero");
        assert!(parse_port_pairs("5000,", "6000,6001").is_err(), "trailing comma");
    }

    #[test]
    #[serial]
    fn test_from_env_host() {
        clear();
        set("GUEST_PORTS", "5555");
        set("HOST_PORTS", "6520");
        set("MAINTAIN_ADB_CONNECTIONS", "false");

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.role, Role::Host);
        assert_eq!(config.ports.len(), 1);
        assert!(!config.maintain_adb_connections);
        assert_eq!(config.adb_daemon_port, 5037);
        assert_eq!(config.dial_retry_interval, Duration::from_secs(1));
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_host_requires_ports() {
        clear();
        assert!(ProxyConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_guest_ignores_ports() {
        clear();
        set("PROXY_ROLE", "Guest");
        set("DIAL_RETRY_INTERVAL_MS", "250");

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.role, Role::Guest);
        assert_eq!(config.role.side(), Side::Guest);
        assert!(config.ports.is_empty());
        assert_eq!(config.dial_retry_interval, Duration::from_millis(250));
        clear();
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("HOST".parse::<Role>().unwrap(), Role::Host);
        assert!("router".parse::<Role>().is_err());
    }
}
