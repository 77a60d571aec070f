//! Thin wrapper around the virsh CLI, the transport for every hypervisor
//! operation: storage pool and volume management, domain define/start/
//! destroy/undefine, and DHCP lease queries.

use std::net::IpAddr;

use camino::Utf8PathBuf;
use color_eyre::eyre::{eyre, Context, Result};
use tokio::process::Command;

use crate::utils;

/// Handle for issuing virsh commands against one connection URI. Cloned
/// freely into fan-out workers.
#[derive(Debug, Clone)]
pub(crate) struct Virsh {
    uri: String,
}

/// Name, capacity, and target path of a storage volume, read from
/// `vol-dumpxml`.
#[derive(Debug, Clone)]
pub(crate) struct VolInfo {
    pub capacity: u64,
    pub path: Utf8PathBuf,
}

impl Virsh {
    pub(crate) fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("virsh");
        cmd.arg("-c").arg(&self.uri).args(args);
        cmd
    }

    /// Run a virsh command, returning its stdout. A non-zero exit becomes
    /// an error carrying virsh's stderr.
    pub(crate) async fn run(&self, args: &[&str]) -> Result<String> {
        tracing::debug!("virsh {}", args.join(" "));
        let out = utils::output_checked(&mut self.command(args)).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Run a virsh command whose failure is an expected outcome (lookups,
    /// best-effort teardown). A non-zero exit maps to Ok(None); only a
    /// spawn failure is an error.
    pub(crate) async fn try_run(&self, args: &[&str]) -> Result<Option<String>> {
        tracing::debug!("virsh {} (may fail)", args.join(" "));
        let out = self
            .command(args)
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to run virsh")?;
        if !out.status.success() {
            tracing::debug!(
                "virsh {}: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&out.stderr).trim()
            );
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).into_owned()))
    }

    /// Fails when the storage pool does not exist or libvirtd is
    /// unreachable.
    pub(crate) async fn check_pool(&self, pool: &str) -> Result<()> {
        self.run(&["pool-info", pool])
            .await
            .map(drop)
            .wrap_err_with(|| format!("lookup storage pool {pool}"))
    }

    /// Looks up a volume by name; Ok(None) when the pool has no such
    /// volume.
    pub(crate) async fn vol_lookup(&self, pool: &str, name: &str) -> Result<Option<VolInfo>> {
        match self.try_run(&["vol-dumpxml", "--pool", pool, name]).await? {
            Some(xml) => Ok(Some(parse_volume_xml(&xml)?)),
            None => Ok(None),
        }
    }

    /// Creates a volume in the pool from the given volume XML.
    pub(crate) async fn vol_create(&self, pool: &str, xml: &str) -> Result<()> {
        let file = utils::temp_file_with("runtopo-volxml.", xml.as_bytes())?;
        let path = utf8_temp_path(&file)?;
        self.run(&["vol-create", pool, path]).await.map(drop)
    }

    /// Uploads a local file into an existing volume.
    pub(crate) async fn vol_upload(&self, pool: &str, name: &str, file: &str) -> Result<()> {
        self.run(&["vol-upload", "--pool", pool, name, file])
            .await
            .map(drop)
    }

    pub(crate) async fn vol_delete(&self, pool: &str, name: &str) -> Result<()> {
        self.run(&["vol-delete", "--pool", pool, name])
            .await
            .map(drop)
    }

    /// Defines a domain from XML, validating it against the libvirt domain
    /// schema.
    pub(crate) async fn define_validated(&self, xml: &str) -> Result<()> {
        let file = utils::temp_file_with("runtopo-domxml.", xml.as_bytes())?;
        let path = utf8_temp_path(&file)?;
        self.run(&["define", "--validate", path]).await.map(drop)
    }

    pub(crate) async fn start_domain(&self, name: &str) -> Result<()> {
        self.run(&["start", name]).await.map(drop)
    }

    /// First address the domain obtained from a libvirt network DHCP
    /// lease, if any.
    pub(crate) async fn domain_lease_address(&self, name: &str) -> Result<Option<IpAddr>> {
        let out = self
            .run(&["domifaddr", name, "--source", "lease"])
            .await
            .wrap_err_with(|| format!("domifaddr {name}"))?;
        Ok(parse_domifaddr(&out))
    }
}

fn utf8_temp_path(file: &tempfile::NamedTempFile) -> Result<&str> {
    file.path()
        .to_str()
        .ok_or_else(|| eyre!("non-UTF-8 temp path: {}", file.path().display()))
}

fn parse_volume_xml(xml: &str) -> Result<VolInfo> {
    let doc = roxmltree::Document::parse(xml).context("parse volume XML")?;
    let root = doc.root_element();
    let capacity = root
        .children()
        .find(|n| n.has_tag_name("capacity"))
        .and_then(|n| n.text())
        .ok_or_else(|| eyre!("volume XML: missing capacity"))?
        .trim()
        .parse::<u64>()
        .context("volume capacity")?;
    let path = root
        .children()
        .find(|n| n.has_tag_name("target"))
        .and_then(|t| t.children().find(|n| n.has_tag_name("path")))
        .and_then(|n| n.text())
        .ok_or_else(|| eyre!("volume XML: missing target path"))?;
    Ok(VolInfo {
        capacity,
        path: Utf8PathBuf::from(path.trim()),
    })
}

// domifaddr prints a header, a separator, and one row per interface:
//  Name   MAC address          Protocol     Address
//  vnet0  52:54:00:4b:73:5f    ipv4         192.168.122.134/24
fn parse_domifaddr(out: &str) -> Option<IpAddr> {
    for line in out.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            continue;
        }
        let addr = fields[3].split('/').next()?;
        if let Ok(ip) = addr.parse() {
            return Some(ip);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_volume_xml() {
        let xml = r#"<volume type='file'>
  <name>leaf0.qcow2</name>
  <key>/var/lib/libvirt/images/leaf0.qcow2</key>
  <capacity unit='bytes'>6442450944</capacity>
  <allocation unit='bytes'>1953497088</allocation>
  <target>
    <path>/var/lib/libvirt/images/leaf0.qcow2</path>
    <format type='qcow2'/>
  </target>
  <backingStore>
    <path>/var/lib/libvirt/images/base.qcow2</path>
    <format type='qcow2'/>
  </backingStore>
</volume>"#;
        let info = parse_volume_xml(xml).unwrap();
        assert_eq!(info.capacity, 6442450944);
        assert_eq!(info.path, "/var/lib/libvirt/images/leaf0.qcow2");
    }

    #[test]
    fn parses_domifaddr_output() {
        let out = " Name       MAC address          Protocol     Address\n\
                    -------------------------------------------------------------------------------\n \
                    vnet0      52:54:00:4b:73:5f    ipv4         192.168.122.134/24\n";
        assert_eq!(
            parse_domifaddr(out),
            Some("192.168.122.134".parse().unwrap())
        );
    }

    #[test]
    fn domifaddr_without_leases() {
        let out = " Name       MAC address          Protocol     Address\n\
                    -------------------------------------------------------------------------------\n";
        assert_eq!(parse_domifaddr(out), None);
    }
}
