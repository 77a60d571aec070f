//! Client-facing outputs: the OpenSSH client configuration and the BMC
//! manifest.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::time::Duration;

use color_eyre::eyre::Result;

use crate::topology::{DeviceFunction, Topology};
use crate::virsh::Virsh;

/// Poll until the domain shows up in a libvirt network's DHCP leases and
/// return its address. Polling is paced at 100 ms; the caller bounds the
/// overall wait.
pub(crate) async fn wait_for_lease(virsh: &Virsh, domain: &str) -> Result<IpAddr> {
    loop {
        if let Some(ip) = virsh.domain_lease_address(domain).await? {
            return Ok(ip);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Renders an ssh_config(5) making every guest reachable: the management
/// server directly by its leased address, everything else via ProxyJump
/// through it.
pub(crate) fn render_ssh_config(server_ip: IpAddr, topo: &Topology) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Host oob-mgmt-server");
    let _ = writeln!(out, "  Hostname {server_ip}");
    let _ = writeln!(out, "  User root");
    let _ = writeln!(out, "  UserKnownHostsFile /dev/null");
    let _ = writeln!(out, "  StrictHostKeyChecking no");
    for d in topo.devices() {
        if d.has_function(&[DeviceFunction::OobServer, DeviceFunction::OobSwitch]) {
            continue;
        }
        let user = if d.function().is_cumulus_like() {
            "cumulus"
        } else {
            "root"
        };
        let _ = writeln!(out, "Host {}", d.name());
        let _ = writeln!(out, "  User {user}");
        let _ = writeln!(out, "  ProxyJump oob-mgmt-server");
        let _ = writeln!(out, "  UserKnownHostsFile /dev/null");
        let _ = writeln!(out, "  StrictHostKeyChecking no");
    }
    out
}
