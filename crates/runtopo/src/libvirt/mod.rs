//! The libvirt runner: materializes a parsed topology as running KVM
//! guests wired together with UDP tunnels.
//!
//! Deploy order: inventory → base images → volumes → define → customize →
//! start → outputs. Each stage that creates resources compensates for them
//! when a later stage fails; compensation never overrides the original
//! error, it only logs. Teardown runs the inverse: BMCs → domains →
//! volumes (base images are kept, they are reusable).

mod customize;
mod domain;
mod inventory;
mod output;
mod vbmc;
mod volume;

pub use vbmc::{Bmc, HostBmc};

use std::collections::BTreeMap;
use std::net::IpAddr;

use camino::Utf8PathBuf;
use color_eyre::eyre::{Context, Result};
use macaddr::MacAddr6;

use crate::topology::{DeviceFunction, Topology};
use crate::virsh::Virsh;

use inventory::DeviceRecord;
use vbmc::BmcManager;
use volume::BaseImage;

const DEFAULT_URI: &str = "qemu:///system";
const DEFAULT_NAME_PREFIX: &str = "runtopo-";
// QEMU's locally-administered OUI; explicitly configured MACs
// (left_mac/right_mac) are unaffected.
const DEFAULT_MAC_BASE: MacAddr6 = MacAddr6::new(0x52, 0x54, 0x00, 0x00, 0x00, 0x00);
const DEFAULT_PORT_BASE: u32 = 10000;
const DEFAULT_PORT_GAP: u32 = 1000;
const DEFAULT_POOL: &str = "default";

/// Deploys and tears down topologies against one libvirt connection.
///
/// Configure with the `with_*` builder methods, then call [`Runner::run`]
/// or [`Runner::destroy`]. The inventory is rebuilt from the topology on
/// every invocation, so a fresh runner configured the same way can destroy
/// what an earlier one created.
pub struct Runner {
    virsh: Virsh,
    devices: BTreeMap<String, DeviceRecord>,
    domains: Vec<String>,
    base_images: BTreeMap<String, BaseImage>,
    bmc: BmcManager,
    bmcs: Vec<HostBmc>,

    // immutable after construction
    uri: String,
    name_prefix: String,
    tunnel_ip: IpAddr,
    mac_base: MacAddr6,
    port_base: u32,
    port_gap: u32,
    pool: String,
    authorized_keys: Vec<String>,
    ssh_config_out: Option<Utf8PathBuf>,
    bmc_config_out: Option<Utf8PathBuf>,
    config_dir: Option<Utf8PathBuf>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            virsh: Virsh::new(DEFAULT_URI),
            devices: BTreeMap::new(),
            domains: Vec::new(),
            base_images: BTreeMap::new(),
            bmc: BmcManager::new(),
            bmcs: Vec::new(),
            uri: DEFAULT_URI.to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            tunnel_ip: IpAddr::from([127, 0, 0, 1]),
            mac_base: DEFAULT_MAC_BASE,
            port_base: DEFAULT_PORT_BASE,
            port_gap: DEFAULT_PORT_GAP,
            pool: DEFAULT_POOL.to_string(),
            authorized_keys: Vec::new(),
            ssh_config_out: None,
            bmc_config_out: None,
            config_dir: None,
        }
    }

    /// Connection URI used to reach libvirtd. Defaults to qemu:///system.
    pub fn with_connect_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self.virsh = Virsh::new(&self.uri);
        self
    }

    /// Prefix for the names of created resources (domains, volumes).
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Default local IP address for UDP tunnel endpoints; devices override
    /// it with the tunnelip node attribute.
    pub fn with_tunnel_ip(mut self, ip: IpAddr) -> Self {
        self.tunnel_ip = ip;
        self
    }

    /// Starting address for automatically assigned MACs.
    pub fn with_mac_base(mut self, mac: MacAddr6) -> Self {
        self.mac_base = mac;
        self
    }

    /// First UDP port used for tunnel allocation.
    pub fn with_port_base(mut self, port: u32) -> Self {
        self.port_base = port;
        self
    }

    /// Gap between a tunnel's two port ranges. Limits how many links a
    /// topology can carry.
    pub fn with_port_gap(mut self, gap: u32) -> Self {
        self.port_gap = gap;
        self
    }

    /// Storage pool holding base images and per-device volumes.
    pub fn with_storage_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    /// SSH public keys added to authorized_keys in every customized guest.
    pub fn with_authorized_keys(mut self, keys: Vec<String>) -> Self {
        self.authorized_keys = keys;
        self
    }

    /// Directory that config node attributes name their files relative to.
    pub fn with_config_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Listen address for virtual BMCs.
    pub fn with_bmc_addr(mut self, addr: impl Into<String>) -> Self {
        self.bmc.set_addr(addr);
        self
    }

    /// Write an OpenSSH client configuration to the given file after the
    /// topology is up.
    pub fn write_ssh_config(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.ssh_config_out = Some(path.into());
        self
    }

    /// Write a JSON document describing the created virtual BMCs to the
    /// given file.
    pub fn write_bmc_config(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.bmc_config_out = Some(path.into());
        self
    }

    /// Start up the topology.
    pub async fn run(&mut self, topo: &Topology) -> Result<()> {
        inventory::build_inventory(self, topo).wrap_err("build inventory")?;
        volume::download_base_images(self).await?;
        volume::create_volumes(self).await?;

        if let Err(err) = self.deploy(topo).await {
            self.rollback().await;
            return Err(err);
        }
        Ok(())
    }

    /// Destroy the resources a previous [`Runner::run`] created for the
    /// topology. Best-effort: missing resources are ignored.
    pub async fn destroy(&mut self, topo: &Topology) -> Result<()> {
        inventory::build_inventory(self, topo).wrap_err("build inventory")?;
        self.bmc.stop_all().await.wrap_err("bmc stop")?;
        self.undefine_domains().await.wrap_err("undefine domains")?;
        volume::delete_volumes(self).await.wrap_err("delete volumes")?;
        self.domains.clear();
        self.base_images.clear();
        Ok(())
    }

    async fn deploy(&mut self, topo: &Topology) -> Result<()> {
        self.define_domains().await?;
        customize::customize_domains(self, topo).await?;
        self.start_domains(topo).await?;

        if let Some(path) = self.ssh_config_out.clone() {
            self.emit_ssh_config(topo, &path)
                .await
                .wrap_err("write ssh config")?;
        }
        if let Some(path) = self.bmc_config_out.clone() {
            let p = serde_json::to_vec(&self.bmcs).context("marshal bmc manifest")?;
            std::fs::write(&path, p).with_context(|| format!("write {path}"))?;
        }
        Ok(())
    }

    // Compensation for a failed deploy; never propagates, only logs.
    async fn rollback(&mut self) {
        if let Err(err) = self.undefine_domains().await {
            tracing::warn!("rollback undefine domains: {err:#}");
        }
        if let Err(err) = volume::delete_volumes(self).await {
            tracing::warn!("rollback delete volumes: {err:#}");
        }
        self.domains.clear();
    }

    async fn define_domains(&mut self) -> Result<()> {
        let mut defined: Vec<String> = Vec::new();
        for d in self.devices.values() {
            let xml = domain::render_domain_xml(d);
            if let Err(err) = self.virsh.define_validated(&xml).await {
                for name in &defined {
                    if self.virsh.try_run(&["undefine", name.as_str()]).await.is_err() {
                        tracing::warn!("rollback undefine {name} failed");
                    }
                }
                return Err(err.wrap_err(format!("define domain {}", d.name)));
            }
            defined.push(d.name.clone());
        }
        self.domains = defined;
        Ok(())
    }

    async fn undefine_domains(&self) -> Result<()> {
        for d in self.devices.values() {
            if self.virsh.try_run(&["domstate", d.name.as_str()]).await?.is_none() {
                continue;
            }
            // Shut the domain down if running, then drop the definition.
            let _ = self.virsh.try_run(&["destroy", d.name.as_str()]).await?;
            let _ = self.virsh.try_run(&["undefine", d.name.as_str()]).await?;
        }
        Ok(())
    }

    // Start domains in function order (the enum's declaration order):
    // management infrastructure first, hosts last.
    async fn start_domains(&mut self, topo: &Topology) -> Result<()> {
        let mut devs: Vec<_> = topo.devices().collect();
        devs.sort_by_key(|d| d.function());

        let mut started: Vec<String> = Vec::new();
        let stop_started = |started: Vec<String>, virsh: Virsh| async move {
            for name in started {
                if virsh.try_run(&["destroy", name.as_str()]).await.is_err() {
                    tracing::warn!("rollback destroy {name} failed");
                }
            }
        };

        for d in devs {
            if d.function() == DeviceFunction::Fake || d.os_image().is_none() {
                continue;
            }
            let name = format!("{}{}", self.name_prefix, d.name());
            if let Err(err) = self.virsh.start_domain(&name).await {
                stop_started(started, self.virsh.clone()).await;
                return Err(err.wrap_err(format!("start domain {name}")));
            }
            started.push(name);
        }

        if let Err(err) = self.bmc.start_all(&self.uri).await {
            stop_started(started, self.virsh.clone()).await;
            return Err(err.wrap_err("bmc start"));
        }
        Ok(())
    }

    async fn emit_ssh_config(&self, topo: &Topology, path: &Utf8PathBuf) -> Result<()> {
        // The management server is the jump host; it needs a DHCP lease
        // before the config is useful.
        let server = format!("{}oob-mgmt-server", self.name_prefix);
        tracing::info!("waiting for {server} to obtain a DHCP lease");
        let ip = output::wait_for_lease(&self.virsh, &server).await?;
        let conf = output::render_ssh_config(ip, topo);
        std::fs::write(path, conf).with_context(|| format!("write {path}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let r = Runner::new();
        assert_eq!(r.uri, "qemu:///system");
        assert_eq!(r.name_prefix, "runtopo-");
        assert_eq!(r.pool, "default");
        assert_eq!(r.port_base, 10000);
        assert_eq!(r.port_gap, 1000);
        assert_eq!(r.tunnel_ip, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(r.mac_base, DEFAULT_MAC_BASE);
    }

    #[test]
    fn builder_overrides() {
        let r = Runner::new()
            .with_connect_uri("qemu+ssh://host/system")
            .with_name_prefix("lab-")
            .with_port_base(20000)
            .with_port_gap(500)
            .with_storage_pool("images")
            .with_tunnel_ip("192.0.2.1".parse().unwrap());
        assert_eq!(r.uri, "qemu+ssh://host/system");
        assert_eq!(r.name_prefix, "lab-");
        assert_eq!(r.port_base, 20000);
        assert_eq!(r.port_gap, 500);
        assert_eq!(r.pool, "images");
    }
}
