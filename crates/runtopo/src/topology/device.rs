//! Devices and their topological roles.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// A Device corresponds to a node in the parsed topology graph.
#[derive(Debug, Clone)]
pub struct Device {
    pub(crate) name: String,
    pub(crate) attrs: BTreeMap<String, String>,
    /// Indices into the topology's link arena for every link that has this
    /// device as an endpoint.
    pub(crate) links: Vec<usize>,
    pub(crate) mgmt_ip: Option<IpAddr>,
}

impl Device {
    pub(crate) fn new(name: impl Into<String>, attrs: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            attrs,
            links: Vec::new(),
            mgmt_ip: None,
        }
    }

    /// The device's hostname.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the node attribute associated with key, if any.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str).filter(|s| !s.is_empty())
    }

    /// The DeviceFunction associated with this device.
    pub fn function(&self) -> DeviceFunction {
        self.attr("function")
            .map(DeviceFunction::from_attr)
            .unwrap_or(DeviceFunction::Unspecified)
    }

    /// Number of virtual CPUs requested for the device (cpu node attribute)
    /// or a function-specific default.
    pub fn vcpus(&self) -> u32 {
        self.attr("cpu")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| defaults_for(self.function()).vcpus)
    }

    /// The device's memory size in bytes. The memory node attribute is in
    /// MiB.
    pub fn memory(&self) -> u64 {
        self.attr("memory")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|mib| mib << 20)
            .unwrap_or_else(|| defaults_for(self.function()).memory)
    }

    /// Size in bytes for a blank disk (disk node attribute, in GiB).
    pub fn disk_size(&self) -> u64 {
        self.attr("disk")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|gib| gib << 30)
            .unwrap_or(8 << 30)
    }

    /// URL of the operating system image for this device, from the os node
    /// attribute with a function-specific fallback. The literal "none"
    /// requests a blank disk and yields None.
    pub fn os_image(&self) -> Option<&str> {
        match self.attr("os") {
            Some("none") => None,
            Some(url) => Some(url),
            None => Some(defaults_for(self.function()).os).filter(|s| !s.is_empty()),
        }
    }

    /// The address assigned on the out-of-band management network, if any.
    pub fn mgmt_ip(&self) -> Option<IpAddr> {
        self.mgmt_ip
    }

    /// Indices of all links involving this device, see
    /// [`Topology::links`](super::Topology::links).
    pub fn link_indices(&self) -> &[usize] {
        &self.links
    }

    /// Whether the device's function is one of the given ones.
    pub fn has_function(&self, fs: &[DeviceFunction]) -> bool {
        fs.contains(&self.function())
    }
}

/// DeviceFunction describes a device's role in the topology and is used for
/// startup ordering as well as determining default OS images. The
/// declaration order is load-bearing: domains start in ascending function
/// order.
///
/// The string representations match the ones understood by
/// topology_converter; changing them breaks existing DOT files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceFunction {
    /// Present in the graph but never materialized.
    Fake,
    OobServer,
    OobSwitch,
    Exit,
    SuperSpine,
    Spine,
    Leaf,
    Tor,
    Host,
    /// No function node attribute.
    Unspecified,
}

impl DeviceFunction {
    pub(crate) fn from_attr(s: &str) -> Self {
        match s {
            "fake" => DeviceFunction::Fake,
            "oob-server" => DeviceFunction::OobServer,
            "oob-switch" => DeviceFunction::OobSwitch,
            "exit" => DeviceFunction::Exit,
            "superspine" => DeviceFunction::SuperSpine,
            "spine" => DeviceFunction::Spine,
            "leaf" => DeviceFunction::Leaf,
            "tor" => DeviceFunction::Tor,
            "host" => DeviceFunction::Host,
            _ => DeviceFunction::Unspecified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFunction::Fake => "fake",
            DeviceFunction::OobServer => "oob-server",
            DeviceFunction::OobSwitch => "oob-switch",
            DeviceFunction::Exit => "exit",
            DeviceFunction::SuperSpine => "superspine",
            DeviceFunction::Spine => "spine",
            DeviceFunction::Leaf => "leaf",
            DeviceFunction::Tor => "tor",
            DeviceFunction::Host => "host",
            DeviceFunction::Unspecified => "",
        }
    }

    /// Whether devices with this function default to Cumulus Linux.
    pub fn is_cumulus_like(&self) -> bool {
        matches!(
            self,
            DeviceFunction::OobSwitch
                | DeviceFunction::Exit
                | DeviceFunction::SuperSpine
                | DeviceFunction::Spine
                | DeviceFunction::Leaf
                | DeviceFunction::Tor
        )
    }
}

impl fmt::Display for DeviceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct FunctionDefaults {
    os: &'static str,
    vcpus: u32,
    memory: u64,
}

const CUMULUS_QCOW2: &str =
    "https://d2cd9e7ca6hntp.cloudfront.net/public/CumulusLinux-4.3.0/cumulus-linux-4.3.0-vx-amd64-qemu.qcow2";
const FEDORA_QCOW2: &str =
    "https://download.fedoraproject.org/pub/fedora/linux/releases/33/Cloud/x86_64/images/Fedora-Cloud-Base-33-1.2.x86_64.qcow2";

fn defaults_for(f: DeviceFunction) -> FunctionDefaults {
    let os = match f {
        DeviceFunction::Fake => "",
        f if f.is_cumulus_like() => CUMULUS_QCOW2,
        _ => FEDORA_QCOW2,
    };
    FunctionDefaults {
        os,
        vcpus: 1,
        memory: 768 << 20,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[DeviceFunction] = &[
        DeviceFunction::Fake,
        DeviceFunction::OobServer,
        DeviceFunction::OobSwitch,
        DeviceFunction::Exit,
        DeviceFunction::SuperSpine,
        DeviceFunction::Spine,
        DeviceFunction::Leaf,
        DeviceFunction::Tor,
        DeviceFunction::Host,
    ];

    #[test]
    fn function_roundtrips() {
        for &f in ALL {
            assert_eq!(DeviceFunction::from_attr(f.as_str()), f, "function {f}");
        }
    }

    #[test]
    fn function_order_is_startup_order() {
        for w in ALL.windows(2) {
            assert!(w[0] < w[1], "{} should start before {}", w[0], w[1]);
        }
        assert!(DeviceFunction::Host < DeviceFunction::Unspecified);
    }

    #[test]
    fn resource_defaults() {
        let d = Device::new("leaf0", BTreeMap::from([("function".into(), "leaf".into())]));
        assert_eq!(d.vcpus(), 1);
        assert_eq!(d.memory(), 768 << 20);
        assert_eq!(d.disk_size(), 8 << 30);
        assert_eq!(d.os_image(), Some(CUMULUS_QCOW2));
    }

    #[test]
    fn resource_attrs_override_defaults() {
        let d = Device::new(
            "host0",
            BTreeMap::from([
                ("function".into(), "host".into()),
                ("cpu".into(), "4".into()),
                ("memory".into(), "2048".into()),
                ("disk".into(), "20".into()),
                ("os".into(), "none".into()),
            ]),
        );
        assert_eq!(d.vcpus(), 4);
        assert_eq!(d.memory(), 2048 << 20);
        assert_eq!(d.disk_size(), 20 << 30);
        assert_eq!(d.os_image(), None, "os=none requests a blank disk");
    }

    #[test]
    fn fake_devices_have_no_image() {
        let d = Device::new("fake0", BTreeMap::from([("function".into(), "fake".into())]));
        assert_eq!(d.os_image(), None);
    }
}
