//! Virtual BMC management.
//!
//! Each registered domain gets an IPMI endpoint backed by the external vbmc
//! tool: one TCP port per domain allocated sequentially from a base, with a
//! single random password shared by all BMCs of a run.

use std::collections::BTreeMap;

use color_eyre::eyre::{eyre, Context, Result};
use serde::Serialize;
use tokio::process::Command;

use crate::utils::{output_checked, random_string};

const DEFAULT_PORT_BASE: u16 = 6230;
const DEFAULT_ADDR: &str = "::";
const IPMI_USER: &str = "runtopo";

/// Connection details for one virtual BMC, as written to the manifest.
#[derive(Debug, Clone, Serialize)]
pub struct Bmc {
    pub addr: String,
    pub user: String,
    pub password: String,
    #[serde(skip)]
    pub(crate) port: u16,
}

/// Manifest entry pairing a topology device with its BMC.
#[derive(Debug, Clone, Serialize)]
pub struct HostBmc {
    pub name: String,
    pub bmc: Bmc,
}

#[derive(Debug)]
pub(crate) struct BmcManager {
    all: BTreeMap<String, Bmc>,
    next_port: u16,

    port_base: u16,
    addr: String,
    user: String,
    password: String,
}

impl BmcManager {
    pub(crate) fn new() -> Self {
        Self {
            all: BTreeMap::new(),
            next_port: DEFAULT_PORT_BASE,
            port_base: DEFAULT_PORT_BASE,
            addr: DEFAULT_ADDR.to_string(),
            user: IPMI_USER.to_string(),
            password: random_string(16),
        }
    }

    pub(crate) fn set_addr(&mut self, addr: impl Into<String>) {
        self.addr = addr.into();
    }

    /// Drops all registrations; the inventory builder calls this so a
    /// rebuilt inventory starts from a clean registry and the port base.
    pub(crate) fn reset(&mut self) {
        self.all.clear();
        self.next_port = self.port_base;
    }

    /// Registers a BMC for the domain, allocating its port. Registering
    /// the same domain twice is an error.
    pub(crate) fn add(&mut self, domain: &str) -> Result<Bmc> {
        if self.all.contains_key(domain) {
            return Err(eyre!("add bmc for {domain}: already exists"));
        }
        let port = self.next_port;
        self.next_port += 1;
        let bmc = Bmc {
            addr: join_host_port(&self.addr, port),
            user: self.user.clone(),
            password: self.password.clone(),
            port,
        };
        self.all.insert(domain.to_string(), bmc.clone());
        Ok(bmc)
    }

    /// Registers and starts every BMC through the vbmc tool. A failed add
    /// rolls back the adds that already happened.
    pub(crate) async fn start_all(&self, libvirt_uri: &str) -> Result<()> {
        let mut added: Vec<&str> = Vec::new();
        for (domain, bmc) in &self.all {
            if let Err(err) = self.vbmc_add(libvirt_uri, domain, bmc).await {
                self.delete_quietly(&added).await;
                return Err(err.wrap_err(format!("vbmc add {domain}")));
            }
            added.push(domain.as_str());
        }
        if added.is_empty() {
            return Ok(());
        }
        if let Err(err) = vbmc_command("start", &added).await {
            self.delete_quietly(&added).await;
            return Err(err);
        }
        Ok(())
    }

    /// Stops and deletes every registered BMC. Best-effort: missing
    /// entries (or an unreachable vbmc daemon) only log.
    pub(crate) async fn stop_all(&self) -> Result<()> {
        let names: Vec<&str> = self.all.keys().map(String::as_str).collect();
        if names.is_empty() {
            return Ok(());
        }
        if let Err(err) = vbmc_command("stop", &names).await {
            tracing::warn!("vbmc stop: {err:#}");
        }
        if let Err(err) = vbmc_command("delete", &names).await {
            tracing::warn!("vbmc delete: {err:#}");
        }
        Ok(())
    }

    async fn vbmc_add(&self, libvirt_uri: &str, domain: &str, bmc: &Bmc) -> Result<()> {
        let port = bmc.port.to_string();
        let mut cmd = Command::new("vbmc");
        cmd.args([
            "add",
            "--libvirt-uri",
            libvirt_uri,
            "--address",
            self.addr.as_str(),
            "--port",
            port.as_str(),
            "--username",
            bmc.user.as_str(),
            "--password",
            bmc.password.as_str(),
            domain,
        ]);
        output_checked(&mut cmd).await.map(drop)
    }

    async fn delete_quietly(&self, domains: &[&str]) {
        if domains.is_empty() {
            return;
        }
        if let Err(err) = vbmc_command("delete", domains).await {
            tracing::warn!("vbmc delete rollback: {err:#}");
        }
    }
}

async fn vbmc_command(verb: &str, domains: &[&str]) -> Result<()> {
    let mut cmd = Command::new("vbmc");
    cmd.arg(verb).args(domains);
    output_checked(&mut cmd)
        .await
        .map(drop)
        .wrap_err_with(|| format!("run vbmc {verb} {domains:?}"))
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_sequential_and_password_shared() {
        let mut m = BmcManager::new();
        let a = m.add("runtopo-leaf0").unwrap();
        let b = m.add("runtopo-leaf1").unwrap();
        assert_eq!(a.port, DEFAULT_PORT_BASE);
        assert_eq!(b.port, DEFAULT_PORT_BASE + 1);
        assert_eq!(a.password, b.password);
        assert_eq!(a.password.len(), 16);
        assert_eq!(a.addr, format!("[::]:{DEFAULT_PORT_BASE}"));
    }

    #[test]
    fn duplicate_add_fails() {
        let mut m = BmcManager::new();
        m.add("runtopo-leaf0").unwrap();
        let err = m.add("runtopo-leaf0").unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn reset_releases_ports() {
        let mut m = BmcManager::new();
        m.add("runtopo-leaf0").unwrap();
        m.reset();
        let again = m.add("runtopo-leaf0").unwrap();
        assert_eq!(again.port, DEFAULT_PORT_BASE);
    }

    #[test]
    fn manifest_serialization_omits_port() {
        let mut m = BmcManager::new();
        let bmc = m.add("runtopo-tor0").unwrap();
        let entry = HostBmc {
            name: "tor0".to_string(),
            bmc,
        };
        let json = serde_json::to_value(vec![entry]).unwrap();
        let obj = &json[0];
        assert_eq!(obj["name"], "tor0");
        assert!(obj["bmc"]["addr"].is_string());
        assert!(obj["bmc"].get("port").is_none());
        assert_eq!(obj["bmc"]["user"], IPMI_USER);
    }

    #[test]
    fn host_port_join_brackets_ipv6() {
        assert_eq!(join_host_port("::", 6230), "[::]:6230");
        assert_eq!(join_host_port("0.0.0.0", 6231), "0.0.0.0:6231");
    }
}
