//! Guest filesystem customization.
//!
//! Every materialized device gets one virt-customize run that injects udev
//! rules binding interface names to MACs, the hostname and timezone, and a
//! per-device command stream, all without booting the guest. Devices fall
//! into one of two profiles: Cumulus-like network switches and generic
//! cloud-image guests.

use std::fmt::Write as _;
use std::net::IpAddr;

use color_eyre::eyre::{eyre, Context, Result};
use indoc::{formatdoc, indoc};
use ipnet::IpNet;
use macaddr::MacAddr6;
use tokio::process::Command;
use tokio::task::JoinSet;

use crate::topology::{DeviceFunction, Topology};
use crate::utils::{self, format_mac, random_string, CancelSignal};

use super::inventory::DeviceRecord;
use super::Runner;

/// Guest OS profile selecting the customization commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceProfile {
    /// Cumulus Linux switches (oob-switch, exit, superspine, spine, leaf,
    /// tor).
    Cumulus,
    /// Cloud-image guests (everything else).
    Generic,
}

impl DeviceProfile {
    pub(crate) fn of(f: DeviceFunction) -> Self {
        if f.is_cumulus_like() {
            DeviceProfile::Cumulus
        } else {
            DeviceProfile::Generic
        }
    }

    /// The login user customization targets on this profile.
    pub(crate) fn login_user(&self) -> &'static str {
        match self {
            DeviceProfile::Cumulus => "cumulus",
            DeviceProfile::Generic => "root",
        }
    }
}

/// Run virt-customize for every device with an OS image, concurrently. The
/// first failure cancels the remaining workers; all workers are drained
/// before returning.
pub(crate) async fn customize_domains(r: &Runner, topo: &Topology) -> Result<()> {
    let (cancel_tx, cancel_rx) = utils::cancellation();
    let mut workers = JoinSet::new();
    for d in r.devices.values() {
        if d.topo.os_image().is_none() {
            // Cannot customize a blank disk image.
            continue;
        }
        let extra = extra_commands(r, topo, d);
        workers.spawn(customize_domain(
            r.uri.clone(),
            d.clone(),
            extra,
            cancel_rx.clone(),
        ));
    }

    let mut first_err: Option<color_eyre::Report> = None;
    while let Some(res) = workers.join_next().await {
        let err = match res {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(join_err) => eyre!("customize worker: {join_err}"),
        };
        cancel_tx.cancel();
        if first_err.is_none() {
            first_err = Some(err);
        }
    }
    match first_err {
        Some(err) => Err(err.wrap_err("customize domains")),
        None => Ok(()),
    }
}

// Commands injected on behalf of the runner: SSH keys for everyone, the
// topology file for Cumulus guests, and the name service files for the
// management server.
fn extra_commands(r: &Runner, topo: &Topology, d: &DeviceRecord) -> String {
    let profile = DeviceProfile::of(d.topo.function());
    let user = profile.login_user();
    let mut buf = String::new();

    if profile == DeviceProfile::Cumulus {
        let dot = String::from_utf8_lossy(topo.dot()).into_owned();
        let _ = writeln!(
            buf,
            "write /etc/ptm.d/topology.dot:{}",
            escape_newlines(&dot)
        );
    }
    for key in &r.authorized_keys {
        let _ = writeln!(buf, "ssh-inject {user}:string:{key}");
        if user != "root" {
            let _ = writeln!(buf, "ssh-inject root:string:{key}");
        }
    }
    if d.topo.function() == DeviceFunction::OobServer {
        let hosts = gather_hosts(r);
        for h in &hosts {
            let _ = writeln!(buf, "append-line /etc/hosts:{} {}", h.ip, h.name);
        }
        let _ = writeln!(
            buf,
            "write /etc/dnsmasq.hostsfile:{}",
            escape_newlines(&dnsmasq_hosts_file(&hosts))
        );
    }

    buf
}

async fn customize_domain(
    uri: String,
    d: DeviceRecord,
    extra: String,
    mut cancel: CancelSignal,
) -> Result<()> {
    let work = async {
        let mut stream = extra;
        // Keeps the config temp file alive until virt-customize finished
        // reading it.
        let _config_file = match &d.config {
            Some(blob) => {
                let file = utils::temp_file_with(&format!("{}-config.", d.name), blob)?;
                let path = file
                    .path()
                    .to_str()
                    .ok_or_else(|| eyre!("non-UTF-8 temp path"))?;
                let _ = writeln!(stream, "run {path}");
                Some(file)
            }
            None => None,
        };
        // The profile commands contain selinux-relabel and therefore come
        // last, after everything else that touches the guest filesystem.
        stream.push_str(&commands_for_device(&d)?);

        let rules = render_udev_rules(&d);
        let udev_write = format!("/etc/udev/rules.d/70-persistent-net.rules:{rules}");
        let mut cmd = Command::new("virt-customize");
        cmd.args([
            "-q",
            "-d",
            d.name.as_str(),
            "-c",
            uri.as_str(),
            "--hostname",
            d.topo.name(),
            "--timezone",
            "Etc/UTC",
            // Cumulus ships a rename script doing s/eth/swp/ which breaks
            // interface naming via udev rules.
            "--delete",
            "/etc/hw_init.d/S10rename_eth_swp.sh",
            "--write",
            udev_write.as_str(),
            "--commands-from-file",
            "/dev/stdin",
        ]);
        utils::output_checked_with_stdin(&mut cmd, stream.as_bytes())
            .await
            .map(drop)
    };

    tokio::select! {
        _ = cancel.canceled() => Err(eyre!("customize {}: canceled", d.name)),
        res = work => res.wrap_err_with(|| format!("customize {}", d.name)),
    }
}

/// One rule per interface, binding the name to the assigned MAC.
fn render_udev_rules(d: &DeviceRecord) -> String {
    let mut rules = String::new();
    for intf in &d.interfaces {
        let _ = writeln!(
            rules,
            r#"ACTION=="add", SUBSYSTEM=="net", ATTR{{address}}=="{}", NAME="{}", SUBSYSTEMS=="pci""#,
            format_mac(&intf.mac),
            intf.name
        );
    }
    rules
}

fn commands_for_device(d: &DeviceRecord) -> Result<String> {
    let mut buf = String::new();
    match DeviceProfile::of(d.topo.function()) {
        DeviceProfile::Cumulus => {
            // These eat enough memory to summon the OOM killer in 512 MiB
            // VMs.
            buf.push_str("run-command systemctl disable netq-agent.service\n");
            buf.push_str("run-command systemctl disable netqd@mgmt.service\n");
            // CL4+ forces password expiry and a change on first login.
            buf.push_str("run-command passwd -x 99999 cumulus\n");
            buf.push_str("write /etc/sudoers.d/no-passwd:%sudo     ALL=(ALL:ALL) NOPASSWD: ALL\n");
            let crypt_pw = bcrypt::hash(random_string(16), bcrypt::DEFAULT_COST)
                .context("hash cumulus password")?;
            let _ = writeln!(buf, "run-command usermod -p '{crypt_pw}' cumulus");
            // libguestfs thinks it cannot set hostnames for Cumulus Linux;
            // write /etc/hostname directly instead.
            let _ = write!(buf, "write /etc/hostname:{}\\\n\n", d.topo.name());
            if d.topo.function() == DeviceFunction::OobSwitch {
                buf.push_str(&mgmt_switch_commands(d));
            }
        }
        DeviceProfile::Generic => {
            // Cloud images without a cloud-init configuration source block
            // the boot until cloud-init gives up.
            for unit in [
                "cloud-init.service",
                "cloud-init-local.service",
                "cloud-config.service",
                "cloud-final.service",
            ] {
                let _ = writeln!(buf, "run-command systemctl disable {unit}");
            }
            buf.push_str("install lldpd\n");
            buf.push_str("run-command systemctl enable lldpd.service\n");
            // Make lldpd announce interface names instead of MAC
            // addresses; names are what the topology file speaks.
            buf.push_str(
                "write /etc/lldpd.d/ifname.conf:configure lldp portidsubtype ifname\\\n\n",
            );
            if d.topo.function() == DeviceFunction::OobServer {
                buf.push_str(&mgmt_server_commands(d)?);
            }
        }
    }
    buf.push_str("selinux-relabel\n");
    Ok(buf)
}

// The management switch bridges every non-management interface.
fn mgmt_switch_commands(d: &DeviceRecord) -> String {
    let ports: Vec<&str> = d
        .interfaces
        .iter()
        .map(|i| i.name.as_str())
        .filter(|n| *n != "eth0")
        .collect();
    let bridge_conf = format!(
        "auto bridge\niface bridge\n    bridge-ports {}\n",
        ports.join(" ")
    );
    format!(
        "write /etc/network/interfaces.d/bridge.intf:{}\n",
        escape_newlines(&bridge_conf)
    )
}

const NFTABLES_RULESET: &str = indoc! {"
    table ip nat {
        chain postrouting {
            type nat hook postrouting priority srcnat; policy accept;
            masquerade
        }
    }
"};

const IFCFG_ETH0: &str = indoc! {"
    TYPE=Ethernet
    DEVICE=eth0
    PEERDNS=yes
    BOOTPROTO=dhcp
    ONBOOT=yes
"};

// The management server NATs the management network out through its
// DHCP-configured uplink and serves DHCP/DNS on eth1.
fn mgmt_server_commands(d: &DeviceRecord) -> Result<String> {
    let prefix_attr = d.topo.attr("mgmt_ip").unwrap_or_default();
    let prefix: IpNet = prefix_attr
        .parse()
        .with_context(|| format!("device {}: parse mgmt_ip {prefix_attr:?}", d.topo.name()))?;

    let ifcfg_eth1 = formatdoc! {"
        TYPE=Ethernet
        DEVICE=eth1
        ONBOOT=yes
        BOOTPROTO=none
        IPADDR={addr}
        PREFIX={prefix_len}
        ",
        addr = prefix.addr(),
        prefix_len = prefix.prefix_len(),
    };
    let dnsmasq_conf = formatdoc! {"
        strict-order
        interface=eth1
        dhcp-range={network},static
        dhcp-no-override
        dhcp-authoritative
        dhcp-hostsfile=/etc/dnsmasq.hostsfile
        ",
        network = prefix.network(),
    };

    let mut buf = String::new();
    buf.push_str("install nftables,dnsmasq\n");
    let _ = writeln!(
        buf,
        "write /etc/sysconfig/network-scripts/ifcfg-eth0:{}",
        escape_newlines(IFCFG_ETH0)
    );
    let _ = writeln!(
        buf,
        "write /etc/sysconfig/network-scripts/ifcfg-eth1:{}",
        escape_newlines(&ifcfg_eth1)
    );
    let _ = writeln!(
        buf,
        "write /etc/sysconfig/nftables.conf:{}",
        escape_newlines(NFTABLES_RULESET)
    );
    buf.push_str("run-command systemctl enable nftables.service\n");
    buf.push_str("write /etc/sysctl.d/98-ipfwd.conf:net.ipv4.ip_forward=1\n");
    let _ = writeln!(
        buf,
        "write /etc/dnsmasq.conf:{}",
        escape_newlines(&dnsmasq_conf)
    );
    buf.push_str("run-command systemctl disable systemd-resolved.service\n");
    // /etc/resolv.conf must be a regular file, not the symlink into
    // systemd-resolved: dnsmasq reads its upstream resolvers from there
    // and NetworkManager writes the DHCP-provided ones into it.
    buf.push_str("delete /etc/resolv.conf\n");
    buf.push_str("write /etc/resolv.conf:#placeholder\n");
    buf.push_str("run-command systemctl enable dnsmasq.service\n");
    Ok(buf)
}

#[derive(Debug)]
pub(crate) struct EtherHost {
    pub name: String,
    pub ip: IpAddr,
    pub mac: MacAddr6,
}

/// Every device that should appear in the management server's name
/// service: managed, materialized, and holding a management address.
pub(crate) fn gather_hosts(r: &Runner) -> Vec<EtherHost> {
    r.devices
        .iter()
        .filter(|(name, _)| *name != "oob-mgmt-server" && *name != "oob-mgmt-switch")
        .filter_map(|(name, d)| {
            let eth0 = d.interfaces.first()?;
            if eth0.name != "eth0" {
                // Most likely a device without a management interface.
                return None;
            }
            let ip = d.topo.mgmt_ip()?;
            Some(EtherHost {
                name: name.clone(),
                ip,
                mac: eth0.mac,
            })
        })
        .collect()
}

/// CSV lines mapping MAC to address to hostname, consumed by dnsmasq.
pub(crate) fn dnsmasq_hosts_file(hosts: &[EtherHost]) -> String {
    let mut buf = String::new();
    for h in hosts {
        let _ = writeln!(buf, "{},{},{}", format_mac(&h.mac), h.ip, h.name);
    }
    buf
}

// virt-customize spreads an argument across multiple lines with a trailing
// backslash continuation.
fn escape_newlines(s: &str) -> String {
    s.replace('\n', "\\\n")
}
