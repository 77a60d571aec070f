//! Builds the runner's internal inventory from a parsed topology: one
//! record per materialized device with stable MAC assignments, symmetric
//! UDP tunnel ports per link, and interfaces in their guest-visible order.

use std::cmp::Ordering;
use std::net::IpAddr;

use color_eyre::eyre::{Context, Result};
use macaddr::MacAddr6;

use crate::topology::{Device, DeviceFunction, Topology};
use crate::utils::{mac_from_u64, mac_to_u64, nat_compare};

use super::Runner;

/// Hypervisor-side representation of one topology device.
#[derive(Debug, Clone)]
pub(crate) struct DeviceRecord {
    /// Hypervisor-scope unique name: the runner's name prefix plus the
    /// topology name.
    pub name: String,
    /// Local address used as the UDP endpoint for this device's tunnels.
    pub tunnel_ip: IpAddr,
    pub pool: String,
    /// Contents of the file named by the config node attribute, if any.
    pub config: Option<Vec<u8>>,
    pub interfaces: Vec<Iface>,
    pub topo: Device,
}

/// A guest NIC.
#[derive(Debug, Clone)]
pub(crate) struct Iface {
    pub name: String,
    pub mac: MacAddr6,
    pub source: IfaceSource,
    pub pxe: bool,
}

/// What an interface attaches to on the host side.
#[derive(Debug, Clone)]
pub(crate) enum IfaceSource {
    /// A named libvirt network.
    Network(String),
    /// One side of a UDP tunnel. This side binds local_port and sends to
    /// remote_ip:port; the peer holds the mirrored pair.
    Tunnel {
        remote_ip: IpAddr,
        port: u32,
        local_port: u32,
    },
}

pub(crate) fn build_inventory(r: &mut Runner, topo: &Topology) -> Result<()> {
    r.devices.clear();
    r.bmcs.clear();
    r.bmc.reset();

    let mut next_mac = mac_to_u64(&r.mac_base);
    let mut allocate_mac = move || {
        let mac = mac_from_u64(next_mac);
        next_mac += 1;
        mac
    };

    for topo_dev in topo.devices() {
        if topo_dev.function() == DeviceFunction::Fake {
            continue;
        }

        let tunnel_ip = match topo_dev.attr("tunnelip") {
            Some(s) => s
                .parse()
                .with_context(|| format!("device {}: parse tunnelip {s:?}", topo_dev.name()))?,
            None => r.tunnel_ip,
        };

        let config = match (topo_dev.attr("config"), &r.config_dir) {
            (Some(file), Some(dir)) => Some(
                std::fs::read(dir.join(file))
                    .with_context(|| format!("device {}: read config {file}", topo_dev.name()))?,
            ),
            _ => None,
        };

        let dev_name = format!("{}{}", r.name_prefix, topo_dev.name());
        if topo_dev.attr("bmc").is_some() {
            let bmc = r
                .bmc
                .add(&dev_name)
                .with_context(|| format!("device {}", topo_dev.name()))?;
            r.bmcs.push(super::vbmc::HostBmc {
                name: topo_dev.name().to_string(),
                bmc,
            });
        }

        r.devices.insert(
            topo_dev.name().to_string(),
            DeviceRecord {
                name: dev_name,
                tunnel_ip,
                pool: r.pool.clone(),
                config,
                interfaces: Vec::new(),
                topo: topo_dev.clone(),
            },
        );
    }

    let mut next_port = r.port_base;
    for l in topo.links() {
        let from_tunnel_ip = r.devices.get(&l.from).map(|d| d.tunnel_ip);
        let to_tunnel_ip = r
            .devices
            .get(&l.to)
            .map(|d| d.tunnel_ip)
            .unwrap_or(r.tunnel_ip);

        if from_tunnel_ip.is_some() {
            let mac = l.from_mac().unwrap_or_else(&mut allocate_mac);
            let half_open_uplink = (l.from == "oob-mgmt-server" || l.from == "oob-mgmt-switch")
                && l.is_half_open();
            let iface = if half_open_uplink {
                // Management uplinks attach to the external libvirt
                // network and consume no tunnel port.
                Iface {
                    name: l.from_port.clone(),
                    mac,
                    source: IfaceSource::Network("default".to_string()),
                    pxe: false,
                }
            } else {
                Iface {
                    name: l.from_port.clone(),
                    mac,
                    source: IfaceSource::Tunnel {
                        remote_ip: to_tunnel_ip,
                        port: next_port,
                        local_port: next_port + r.port_gap,
                    },
                    pxe: l.from_pxe(),
                }
            };
            if let Some(from) = r.devices.get_mut(&l.from) {
                from.interfaces.push(iface);
            }
            if half_open_uplink {
                continue;
            }
        }

        if let Some(to) = r.devices.get_mut(&l.to) {
            let mac = l.to_mac().unwrap_or_else(&mut allocate_mac);
            to.interfaces.push(Iface {
                name: l.to_port.clone(),
                mac,
                source: IfaceSource::Tunnel {
                    remote_ip: from_tunnel_ip.unwrap_or(r.tunnel_ip),
                    port: next_port + r.port_gap,
                    local_port: next_port,
                },
                pxe: l.to_pxe(),
            });
        }
        next_port += 1;
    }

    for d in r.devices.values_mut() {
        d.interfaces.sort_by(|a, b| iface_order(&a.name, &b.name));
    }

    Ok(())
}

// eth0 sorts first, the rest in natural order.
fn iface_order(a: &str, b: &str) -> Ordering {
    match (a == "eth0", b == "eth0") {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => nat_compare(a, b),
    }
}
