//! Point-to-point connections between devices.

use std::collections::BTreeMap;
use std::fmt;

use macaddr::MacAddr6;

/// A Link corresponds to an edge in the input graph and describes a
/// point-to-point connection between two devices. Port strings name the
/// interfaces on either side (swp1, eth0).
///
/// A link with an empty `to` endpoint is half-open: the `from` side attaches
/// to an external libvirt network instead of a tunnel. Half-open links only
/// occur on the synthesized management uplinks.
#[derive(Debug, Clone, Default)]
pub struct Link {
    pub from: String,
    pub from_port: String,
    pub to: String,
    pub to_port: String,

    pub(crate) attrs: BTreeMap<String, String>,
}

impl Link {
    /// Returns the value associated with the edge attribute key.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str).filter(|s| !s.is_empty())
    }

    /// The explicit MAC address for the `from` side (left_mac edge
    /// attribute), if any. Attribute values are validated during parsing.
    pub fn from_mac(&self) -> Option<MacAddr6> {
        self.attr("left_mac").and_then(|s| s.parse().ok())
    }

    /// The explicit MAC address for the `to` side (right_mac edge
    /// attribute), if any.
    pub fn to_mac(&self) -> Option<MacAddr6> {
        self.attr("right_mac").and_then(|s| s.parse().ok())
    }

    /// Whether the `from` side interface should network-boot.
    pub fn from_pxe(&self) -> bool {
        self.attr("left_pxe").is_some()
    }

    /// Whether the `to` side interface should network-boot.
    pub fn to_pxe(&self) -> bool {
        self.attr("right_pxe").is_some()
    }

    pub fn is_half_open(&self) -> bool {
        self.to.is_empty()
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -- {}:{}",
            self.from, self.from_port, self.to, self.to_port
        )
    }
}
