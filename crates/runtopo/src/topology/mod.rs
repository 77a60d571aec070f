//! Topology model: parses a DOT graph description into devices and links
//! and optionally augments it with an out-of-band management network.
//!
//! A parsed [`Topology`] is immutable. Devices live in a name-keyed map and
//! links in an arena; devices refer back to their links through indices so
//! the cyclic device/link shape needs no owning references. All iteration
//! that feeds address assignment happens in device-name order, keeping MAC
//! and management-IP allocation reproducible across runs.

mod device;
mod graph;
mod ipalloc;
mod link;

pub use device::{Device, DeviceFunction};
pub use link::Link;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use thiserror::Error;

use ipalloc::IpAllocator;

/// Errors produced while parsing a topology. Parsing has no side effects;
/// on error nothing was created.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("parse dot: {0}")]
    Dot(String),
    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),
    #[error("edge has unknown nodes: {0}")]
    UnknownEndpoint(String),
    #[error("device {device}: bad {attr} attribute {value:?}")]
    BadDeviceAttr {
        device: String,
        attr: &'static str,
        value: String,
    },
    #[error("link {link}: bad {attr} attribute {value:?}")]
    BadLinkAttr {
        link: String,
        attr: &'static str,
        value: String,
    },
    #[error("device {device}: unable to reserve ip {ip}")]
    MgmtReserve { device: String, ip: IpAddr },
    #[error("device {device}: mgmt ip range exhausted (prefix: {prefix})")]
    MgmtExhausted { device: String, prefix: IpNet },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options customizing topology processing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Augment the topology with an out-of-band management network: a
    /// management switch and server, the latter running DHCP and DNS for
    /// all devices. Devices are attached to the management switch unless
    /// they carry the no_mgmt node attribute.
    pub auto_mgmt: bool,
}

/// A parsed network topology graph.
#[derive(Debug)]
pub struct Topology {
    devices: BTreeMap<String, Device>,
    links: Vec<Link>,
    auto_mgmt: bool,
    dot: Vec<u8>,
}

impl Topology {
    /// Unmarshal a DOT graph description.
    pub fn parse(dot: &[u8], opts: Options) -> Result<Topology, ParseError> {
        let input = std::str::from_utf8(dot)
            .map_err(|e| ParseError::Dot(format!("input is not valid UTF-8: {e}")))?;
        let (nodes, edges) = graph::unmarshal(input)?;

        let mut devices: BTreeMap<String, Device> = BTreeMap::new();
        for n in nodes {
            if !is_valid_hostname(&n.name) {
                return Err(ParseError::InvalidHostname(n.name));
            }
            devices.insert(n.name.clone(), Device::new(n.name, n.attrs));
        }

        let mut links: Vec<Link> = edges
            .into_iter()
            .map(|e| Link {
                from: e.from,
                from_port: e.from_port,
                to: e.to,
                to_port: e.to_port,
                attrs: e.attrs,
            })
            .collect();
        for l in &links {
            for attr in ["left_mac", "right_mac"] {
                if let Some(v) = l.attr(attr) {
                    if v.parse::<macaddr::MacAddr6>().is_err() {
                        return Err(ParseError::BadLinkAttr {
                            link: l.to_string(),
                            attr,
                            value: v.to_string(),
                        });
                    }
                }
            }
        }

        if opts.auto_mgmt {
            setup_auto_mgmt_network(&mut devices, &mut links)?;
        }

        // Associate links with their endpoints. A half-open link is only
        // legal as a management uplink.
        for (i, l) in links.iter().enumerate() {
            let from_known = devices.contains_key(&l.from);
            let to_known = devices.contains_key(&l.to);
            if !from_known || !to_known {
                let mgmt_uplink = (l.from == "oob-mgmt-server" || l.from == "oob-mgmt-switch")
                    && l.from_port == "eth0"
                    && l.to.is_empty();
                if !(from_known && mgmt_uplink) {
                    return Err(ParseError::UnknownEndpoint(l.to_string()));
                }
            }
            if let Some(d) = devices.get_mut(&l.from) {
                d.links.push(i);
            }
            if !l.to.is_empty() {
                if let Some(d) = devices.get_mut(&l.to) {
                    d.links.push(i);
                }
            }
        }

        Ok(Topology {
            devices,
            links,
            auto_mgmt: opts.auto_mgmt,
            dot: dot.to_vec(),
        })
    }

    /// Like [`Topology::parse`] but reads the DOT graph description from
    /// the file located by path.
    pub fn parse_file(path: impl AsRef<Path>, opts: Options) -> Result<Topology, ParseError> {
        let p = std::fs::read(path)?;
        Topology::parse(&p, opts)
    }

    /// The devices defined in the topology, in name order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Looks up a device by name.
    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    /// The connections between devices: graph edges in statement order,
    /// followed by any synthesized management links.
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// All links involving d as an endpoint.
    pub fn links_of<'a>(&'a self, d: &'a Device) -> impl Iterator<Item = &'a Link> {
        d.link_indices().iter().map(|&i| &self.links[i])
    }

    /// The original input DOT description.
    pub fn dot(&self) -> &[u8] {
        &self.dot
    }

    /// Whether the out-of-band management network was synthesized.
    pub fn auto_mgmt(&self) -> bool {
        self.auto_mgmt
    }
}

const MGMT_SERVER: &str = "oob-mgmt-server";
const MGMT_SWITCH: &str = "oob-mgmt-switch";

fn setup_auto_mgmt_network(
    devices: &mut BTreeMap<String, Device>,
    links: &mut Vec<Link>,
) -> Result<(), ParseError> {
    if !devices.contains_key(MGMT_SERVER) {
        devices.insert(
            MGMT_SERVER.to_string(),
            Device::new(
                MGMT_SERVER,
                BTreeMap::from([
                    ("function".to_string(), DeviceFunction::OobServer.as_str().to_string()),
                    ("mgmt_ip".to_string(), "192.168.200.254/24".to_string()),
                ]),
            ),
        );
    }
    links.push(Link {
        from: MGMT_SERVER.to_string(),
        from_port: "eth0".to_string(),
        ..Link::default()
    });

    if !devices.contains_key(MGMT_SWITCH) {
        devices.insert(
            MGMT_SWITCH.to_string(),
            Device::new(
                MGMT_SWITCH,
                BTreeMap::from([(
                    "function".to_string(),
                    DeviceFunction::OobSwitch.as_str().to_string(),
                )]),
            ),
        );
    }
    links.push(Link {
        from: MGMT_SWITCH.to_string(),
        from_port: "eth0".to_string(),
        ..Link::default()
    });
    links.push(Link {
        from: MGMT_SERVER.to_string(),
        from_port: "eth1".to_string(),
        to: MGMT_SWITCH.to_string(),
        to_port: "swp1".to_string(),
        ..Link::default()
    });

    let prefix_attr = devices[MGMT_SERVER].attr("mgmt_ip").unwrap_or_default().to_string();
    let mgmt_prefix: IpNet = prefix_attr.parse().map_err(|_| ParseError::BadDeviceAttr {
        device: MGMT_SERVER.to_string(),
        attr: "mgmt_ip",
        value: prefix_attr.clone(),
    })?;
    let mut alloc = IpAllocator::new(mgmt_prefix);
    // The server keeps its own address out of the pool.
    alloc.reserve(mgmt_prefix.addr());

    // Reserve addresses configured with explicit node attrs, in name order.
    for (name, d) in devices.iter_mut() {
        if is_unmanaged(d) {
            continue;
        }
        let Some(ip_attr) = d.attr("mgmt_ip") else {
            continue;
        };
        let ip: IpAddr = ip_attr.parse().map_err(|_| ParseError::BadDeviceAttr {
            device: name.clone(),
            attr: "mgmt_ip",
            value: ip_attr.to_string(),
        })?;
        if !alloc.reserve(ip) {
            return Err(ParseError::MgmtReserve {
                device: name.clone(),
                ip,
            });
        }
        d.mgmt_ip = Some(ip);
    }

    // Wire up devices to the OOB switch and allocate addresses for those
    // without an explicit one, again in name order.
    let mut if_index = 2;
    for (name, d) in devices.iter_mut() {
        if is_unmanaged(d) {
            continue;
        }
        links.push(Link {
            from: MGMT_SWITCH.to_string(),
            from_port: format!("swp{if_index}"),
            to: name.clone(),
            to_port: "eth0".to_string(),
            ..Link::default()
        });
        if_index += 1;

        if d.mgmt_ip.is_none() {
            let ip = alloc.allocate().ok_or_else(|| ParseError::MgmtExhausted {
                device: name.clone(),
                prefix: mgmt_prefix,
            })?;
            d.mgmt_ip = Some(ip);
        }
    }

    Ok(())
}

// Devices that never get a management link: the OOB infrastructure itself,
// fake devices, and anything opted out via no_mgmt.
fn is_unmanaged(d: &Device) -> bool {
    d.attr("no_mgmt").is_some()
        || d.has_function(&[
            DeviceFunction::OobServer,
            DeviceFunction::OobSwitch,
            DeviceFunction::Fake,
        ])
}

fn is_valid_hostname(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() < 2 {
        return false;
    }
    b[0].is_ascii_alphabetic()
        && b[b.len() - 1].is_ascii_alphanumeric()
        && b[1..b.len() - 1]
            .iter()
            .all(|c| c.is_ascii_alphanumeric() || *c == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LEAFSPINE: &str = include_str!("../../testdata/leafspine.dot");
    const LEAFSPINE_NOMGMT: &str = include_str!("../../testdata/leafspine-nomgmt.dot");

    #[test]
    fn parse_leafspine_nomgmt() {
        let topo = Topology::parse(LEAFSPINE_NOMGMT.as_bytes(), Options::default()).unwrap();
        assert_eq!(topo.devices().count(), 5);
        assert_eq!(topo.links().len(), 6);
        for d in topo.devices() {
            let want = if d.name() == "spine0" || d.name() == "spine1" {
                DeviceFunction::Spine
            } else {
                DeviceFunction::Leaf
            };
            assert_eq!(d.function(), want, "device {}", d.name());
        }
    }

    #[test]
    fn parse_auto_mgmt_network() {
        let topo = Topology::parse(LEAFSPINE.as_bytes(), Options { auto_mgmt: true }).unwrap();
        assert_eq!(topo.devices().count(), 8);
        assert_eq!(topo.links().len(), 15);

        let server = topo.device("oob-mgmt-server").unwrap();
        assert_eq!(server.function(), DeviceFunction::OobServer);
        assert_eq!(server.attr("mgmt_ip"), Some("192.168.200.254/24"));
        let switch = topo.device("oob-mgmt-switch").unwrap();
        assert_eq!(switch.function(), DeviceFunction::OobSwitch);
    }

    #[test]
    fn mgmt_ips_allocated_in_name_order() {
        let topo = Topology::parse(LEAFSPINE.as_bytes(), Options { auto_mgmt: true }).unwrap();
        let got: Vec<(String, IpAddr)> = topo
            .devices()
            .filter_map(|d| Some((d.name().to_string(), d.mgmt_ip()?)))
            .collect();
        let want: Vec<(String, IpAddr)> = [
            ("leaf0", "192.168.200.1"),
            ("leaf1", "192.168.200.2"),
            ("server0", "192.168.200.3"),
            ("server1", "192.168.200.4"),
            ("spine0", "192.168.200.5"),
            ("spine1", "192.168.200.6"),
        ]
        .iter()
        .map(|(n, ip)| (n.to_string(), ip.parse().unwrap()))
        .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn explicit_mgmt_ip_is_reserved() {
        let dot = br#"graph {
            "leaf0" [function="leaf" mgmt_ip="192.168.200.1"]
            "leaf1" [function="leaf"]
            "leaf0":"swp1" -- "leaf1":"swp1"
        }"#;
        let topo = Topology::parse(dot, Options { auto_mgmt: true }).unwrap();
        assert_eq!(
            topo.device("leaf0").unwrap().mgmt_ip(),
            Some("192.168.200.1".parse().unwrap())
        );
        assert_eq!(
            topo.device("leaf1").unwrap().mgmt_ip(),
            Some("192.168.200.2".parse().unwrap()),
            "allocation skips the reserved address"
        );
    }

    #[test]
    fn duplicate_mgmt_ip_fails() {
        let dot = br#"graph {
            "leaf0" [function="leaf" mgmt_ip="192.168.200.1"]
            "leaf1" [function="leaf" mgmt_ip="192.168.200.1"]
            "leaf0":"swp1" -- "leaf1":"swp1"
        }"#;
        let err = Topology::parse(dot, Options { auto_mgmt: true }).unwrap_err();
        assert!(matches!(err, ParseError::MgmtReserve { .. }), "{err}");
    }

    #[test]
    fn mgmt_ip_outside_prefix_fails() {
        let dot = br#"graph {
            "leaf0" [function="leaf" mgmt_ip="10.1.2.3"]
            "leaf1" [function="leaf"]
            "leaf0":"swp1" -- "leaf1":"swp1"
        }"#;
        let err = Topology::parse(dot, Options { auto_mgmt: true }).unwrap_err();
        assert!(matches!(err, ParseError::MgmtReserve { .. }), "{err}");
    }

    #[test]
    fn no_mgmt_opts_out() {
        let dot = br#"graph {
            "leaf0" [function="leaf" no_mgmt="true"]
            "leaf1" [function="leaf"]
            "leaf0":"swp1" -- "leaf1":"swp1"
        }"#;
        let topo = Topology::parse(dot, Options { auto_mgmt: true }).unwrap();
        assert_eq!(topo.device("leaf0").unwrap().mgmt_ip(), None);
        let mgmt_links: Vec<_> = topo
            .links()
            .iter()
            .filter(|l| l.from == "oob-mgmt-switch" && !l.to.is_empty())
            .collect();
        assert_eq!(mgmt_links.len(), 1);
        assert_eq!(mgmt_links[0].to, "leaf1");
    }

    #[test]
    fn parallel_links_parse() {
        let dot = br#"graph {
            "a" [function="leaf"]
            "b" [function="leaf"]
            "a":"swp1" -- "b":"swp1"
            "a":"swp2" -- "b":"swp2"
        }"#;
        let topo = Topology::parse(dot, Options::default()).unwrap();
        assert_eq!(topo.links().len(), 2);
        let a = topo.device("a").unwrap();
        assert_eq!(topo.links_of(a).count(), 2);
    }

    #[test]
    fn invalid_hostname_fails() {
        let dot = br#"graph { "h_with_underscore" }"#;
        let err = Topology::parse(dot, Options::default()).unwrap_err();
        assert!(
            err.to_string().contains("invalid hostname"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn bad_link_mac_fails() {
        let dot = br#"graph {
            "a":"swp1" -- "b":"swp1" [left_mac="not-a-mac"]
        }"#;
        let err = Topology::parse(dot, Options::default()).unwrap_err();
        assert!(matches!(err, ParseError::BadLinkAttr { .. }), "{err}");
    }

    #[test]
    fn dot_bytes_are_retained() {
        let topo = Topology::parse(LEAFSPINE.as_bytes(), Options::default()).unwrap();
        assert_eq!(topo.dot(), LEAFSPINE.as_bytes());
    }

    #[test]
    fn hostname_validation() {
        for ok in ["ab", "leaf0", "a-1", "spine-00"] {
            assert!(is_valid_hostname(ok), "{ok} should be valid");
        }
        for bad in ["", "a", "0leaf", "-leaf", "leaf-", "h_x", "a b"] {
            assert!(!is_valid_hostname(bad), "{bad} should be invalid");
        }
    }
}
