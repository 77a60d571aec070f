//! Domain XML rendering.
//!
//! All guests share the same fixed hardware: q35 machine, host-model CPU,
//! virtio disk/NIC/balloon/RNG, a guest-agent channel, and spice graphics
//! with the RTC on UTC. Interfaces are the variable part: either a named
//! libvirt network or one side of a UDP tunnel.

use super::inventory::{DeviceRecord, Iface, IfaceSource};
use crate::utils::format_mac;

pub(crate) fn render_domain_xml(d: &DeviceRecord) -> String {
    let pxe_boot = d.interfaces.iter().any(|i| i.pxe);

    let loader = if d.topo.attr("uefi").is_some() {
        "    <loader readonly='yes' type='pflash'>/usr/share/OVMF/OVMF_CODE.fd</loader>\n"
    } else {
        ""
    };
    // With PXE in play, explicit per-device boot orders replace the
    // os-level boot device: marked interfaces first, the disk as fallback.
    let os_boot = if pxe_boot {
        ""
    } else {
        "    <boot dev='hd'/>\n"
    };
    let disk_boot = if pxe_boot {
        "      <boot order='2'/>\n"
    } else {
        ""
    };

    let mut interfaces = String::new();
    for intf in &d.interfaces {
        interfaces.push_str(&render_interface_xml(d, intf));
    }

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory}</memory>
  <currentMemory unit='KiB'>{memory}</currentMemory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
{loader}{os_boot}  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-model'/>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <disk type='volume' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source pool='{pool}' volume='{volume}'/>
      <target dev='vda' bus='virtio'/>
{disk_boot}    </disk>
    <controller type='usb' model='qemu-xhci'/>
{interfaces}    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <rng model='virtio'>
      <backend model='random'>/dev/urandom</backend>
    </rng>
    <memballoon model='virtio'/>
    <graphics type='spice' autoport='yes'/>
    <video>
      <model type='qxl'/>
    </video>
  </devices>
</domain>
"#,
        name = xml_escape(&d.name),
        memory = d.topo.memory() >> 10,
        vcpus = d.topo.vcpus(),
        pool = xml_escape(&d.pool),
        volume = xml_escape(&d.name),
    )
}

fn render_interface_xml(d: &DeviceRecord, intf: &Iface) -> String {
    let mac = format_mac(&intf.mac);
    let boot = if intf.pxe {
        "      <boot order='1'/>\n"
    } else {
        ""
    };
    match &intf.source {
        IfaceSource::Network(network) => format!(
            r#"    <interface type='network'>
      <mac address='{mac}'/>
      <source network='{network}'/>
      <model type='virtio'/>
{boot}    </interface>
"#,
            network = xml_escape(network),
        ),
        IfaceSource::Tunnel {
            remote_ip,
            port,
            local_port,
        } => format!(
            r#"    <interface type='udp'>
      <mac address='{mac}'/>
      <source address='{remote_ip}' port='{port}'>
        <local address='{local_ip}' port='{local_port}'/>
      </source>
      <model type='virtio'/>
{boot}    </interface>
"#,
            local_ip = d.tunnel_ip,
        ),
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::super::inventory::build_inventory;
    use super::super::Runner;
    use super::*;
    use crate::topology::{Options, Topology};

    const LEAFSPINE: &str = include_str!("../../testdata/leafspine.dot");
    const PXEHOST: &str = include_str!("../../testdata/pxehost.dot");

    fn boot_order(node: roxmltree::Node) -> Option<u32> {
        node.children()
            .find(|n| n.has_tag_name("boot"))
            .and_then(|b| b.attribute("order"))
            .and_then(|o| o.parse().ok())
    }

    #[test]
    fn pxe_boot_orders() {
        let topo = Topology::parse(PXEHOST.as_bytes(), Options::default()).unwrap();
        let mut r = Runner::new();
        build_inventory(&mut r, &topo).unwrap();

        let xml = render_domain_xml(&r.devices["host0"]);
        let doc = roxmltree::Document::parse(&xml).unwrap();

        let disk = doc
            .descendants()
            .find(|n| n.has_tag_name("disk"))
            .expect("no disk");
        assert_eq!(boot_order(disk), Some(2), "disk must be the boot fallback");

        let pxe_interfaces = doc
            .descendants()
            .filter(|n| n.has_tag_name("interface"))
            .filter(|n| boot_order(*n) == Some(1))
            .count();
        assert_eq!(pxe_interfaces, 1);

        assert!(
            !doc.descendants()
                .any(|n| n.has_tag_name("boot") && n.attribute("dev").is_some()),
            "per-device boot order excludes <boot dev=…>"
        );
    }

    #[test]
    fn disk_boot_without_pxe() {
        let topo = Topology::parse(LEAFSPINE.as_bytes(), Options::default()).unwrap();
        let mut r = Runner::new();
        build_inventory(&mut r, &topo).unwrap();

        let xml = render_domain_xml(&r.devices["leaf0"]);
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let os = doc
            .descendants()
            .find(|n| n.has_tag_name("os"))
            .expect("no os element");
        assert_eq!(
            os.children()
                .find(|n| n.has_tag_name("boot"))
                .and_then(|b| b.attribute("dev")),
            Some("hd")
        );
    }

    #[test]
    fn every_domain_renders_well_formed_xml() {
        let topo = Topology::parse(LEAFSPINE.as_bytes(), Options { auto_mgmt: true }).unwrap();
        let mut r = Runner::new();
        build_inventory(&mut r, &topo).unwrap();

        for d in r.devices.values() {
            let xml = render_domain_xml(d);
            let doc = roxmltree::Document::parse(&xml)
                .unwrap_or_else(|e| panic!("domain {}: {e}", d.name));
            let name = doc
                .descendants()
                .find(|n| n.has_tag_name("name"))
                .and_then(|n| n.text());
            assert_eq!(name, Some(d.name.as_str()));
        }
    }

    #[test]
    #[ignore = "requires virt-xml-validate"]
    fn rendered_domains_validate_against_schema() {
        let topo = Topology::parse(LEAFSPINE.as_bytes(), Options { auto_mgmt: true }).unwrap();
        let mut r = Runner::new();
        build_inventory(&mut r, &topo).unwrap();

        for d in r.devices.values() {
            let xml = render_domain_xml(d);
            let file = crate::utils::temp_file_with("runtopo-domxml.", xml.as_bytes()).unwrap();
            let out = std::process::Command::new("virt-xml-validate")
                .arg(file.path())
                .arg("domain")
                .output()
                .expect("run virt-xml-validate");
            assert!(
                out.status.success(),
                "domain {}: {}",
                d.name,
                String::from_utf8_lossy(&out.stderr)
            );
        }
    }

    #[test]
    fn udp_tunnel_endpoints_are_mirrored_in_xml() {
        let topo = Topology::parse(LEAFSPINE.as_bytes(), Options::default()).unwrap();
        let mut r = Runner::new();
        build_inventory(&mut r, &topo).unwrap();

        let parse_sources = |xml: &str| -> Vec<(String, String, String)> {
            let doc = roxmltree::Document::parse(xml).unwrap();
            doc.descendants()
                .filter(|n| n.has_tag_name("source") && n.attribute("port").is_some())
                .map(|s| {
                    let local = s
                        .children()
                        .find(|n| n.has_tag_name("local"))
                        .expect("udp source without local endpoint");
                    (
                        s.attribute("port").unwrap().to_string(),
                        local.attribute("port").unwrap().to_string(),
                        local.attribute("address").unwrap().to_string(),
                    )
                })
                .collect()
        };
        // leaf0:swp1 -- spine0:swp1 is the first link: leaf0 sends to
        // 10000 and binds 11000, spine0 the other way around.
        let leaf_sources = parse_sources(&render_domain_xml(&r.devices["leaf0"]));
        let spine_sources = parse_sources(&render_domain_xml(&r.devices["spine0"]));
        assert!(leaf_sources.contains(&("10000".into(), "11000".into(), "127.0.0.1".into())));
        assert!(spine_sources.contains(&("11000".into(), "10000".into(), "127.0.0.1".into())));
    }
}
