//! End-to-end test against a live libvirt daemon.
//!
//! Ignored by default: it needs libvirtd with a default storage pool and
//! network, outbound HTTP for the base images, and the virt-customize and
//! vbmc tools on PATH. Run with `cargo test -- --ignored` on a prepared
//! host.

use runtopo::libvirt::Runner;
use runtopo::topology::{Options, Topology};

#[tokio::test]
#[ignore = "requires a libvirt daemon, network access, and virt-customize"]
async fn run_and_destroy_leafspine() {
    let topo = Topology::parse_file("testdata/leafspine.dot", Options { auto_mgmt: true })
        .expect("parse fixture");

    let ssh_config = tempfile::NamedTempFile::new().expect("temp file");
    let mut runner = Runner::new()
        .with_name_prefix("runtopo-e2e-")
        .write_ssh_config(ssh_config.path().to_str().expect("utf8 path"));

    let run_res = runner.run(&topo).await;
    // Tear down whatever came up, even after a failed run.
    let destroy_res = runner.destroy(&topo).await;

    run_res.expect("run topology");
    destroy_res.expect("destroy topology");

    let conf = std::fs::read_to_string(ssh_config.path()).expect("read ssh config");
    assert!(conf.contains("Host oob-mgmt-server"));
}
