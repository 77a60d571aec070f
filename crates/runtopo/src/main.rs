//! Command runtopo starts up (or tears down) a network topology described
//! by the DOT file provided as a positional argument.

use std::net::IpAddr;
use std::path::Path;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::{Context, Result};
use macaddr::MacAddr6;

use runtopo::libvirt::Runner;
use runtopo::topology::{Options, Topology};

/// Materialize a DOT-described network topology as libvirt/KVM guests
/// wired together with UDP tunnels.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Connect to the specified hypervisor URI
    #[clap(
        short = 'c',
        long = "connect",
        env = "LIBVIRT_DEFAULT_URI",
        value_name = "URI",
        default_value = "qemu:///system"
    )]
    connect: String,

    /// Prefix the names of created resources with this string
    #[clap(long, env = "RUNTOPO_NAME_PREFIX", default_value = "runtopo-")]
    nameprefix: String,

    /// Start auto-assigned MAC addresses at this base
    #[clap(
        long,
        env = "RUNTOPO_MAC_BASE",
        value_name = "MAC",
        default_value = "52:54:00:00:00:00"
    )]
    macbase: MacAddr6,

    /// Local IP address used for UDP tunnel endpoints
    #[clap(
        long,
        env = "RUNTOPO_TUNNEL_IP",
        value_name = "IP",
        default_value = "127.0.0.1"
    )]
    tunnelip: IpAddr,

    /// Start allocating UDP tunnel ports at this base
    #[clap(long, env = "RUNTOPO_PORT_BASE", default_value_t = 10000)]
    portbase: u32,

    /// Leave this many ports between the local and remote side of a link
    #[clap(long, env = "RUNTOPO_PORT_GAP", default_value_t = 1000)]
    portgap: u32,

    /// Create the automatic out-of-band management network
    #[clap(long, env = "RUNTOPO_AUTO_MGMT")]
    automgmt: bool,

    /// Store downloaded base images and created per-device volumes in this
    /// libvirt storage pool
    #[clap(long, env = "RUNTOPO_LIBVIRT_POOL", default_value = "default")]
    pool: String,

    /// Write an OpenSSH client configuration to this file
    #[clap(long, env = "RUNTOPO_WRITE_SSH_CONFIG", value_name = "FILE")]
    writesshconfig: Option<Utf8PathBuf>,

    /// Write a JSON description of created virtual BMCs to this file
    #[clap(long, env = "RUNTOPO_WRITE_BMC_CONFIG", value_name = "FILE")]
    writebmcconfig: Option<Utf8PathBuf>,

    /// Listen address for virtual BMCs
    #[clap(long, env = "RUNTOPO_BMC_ADDR", value_name = "ADDR")]
    bmcaddr: Option<String>,

    /// Resolve config node attributes relative to this directory
    #[clap(long, env = "RUNTOPO_CONFIG_DIR", value_name = "DIR")]
    configdir: Option<Utf8PathBuf>,

    /// Tear down a previously started topology instead of starting one
    #[clap(long, env = "RUNTOPO_DESTROY")]
    destroy: bool,

    /// Path to the topology description in DOT format
    #[clap(value_name = "TOPOLOGY.DOT")]
    topology: Utf8PathBuf,
}

/// Install and configure the tracing/logging system: stderr output,
/// filtered by RUST_LOG and defaulting to warnings only.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();
    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap_or_default();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() {
    install_tracing();
    let _ = color_eyre::install();

    let cli = Cli::parse();
    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => fatal(&format!("init tokio runtime: {err}")),
    };
    if let Err(err) = rt.block_on(run(cli)) {
        fatal(&format!("{err:#}"));
    }
}

// User-visible failure is a single `executable: error` line, exit code 1.
fn fatal(msg: &str) -> ! {
    let exe = std::env::args()
        .next()
        .as_deref()
        .map(|a| {
            Path::new(a)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| a.to_string())
        })
        .unwrap_or_else(|| "runtopo".to_string());
    eprintln!("{exe}: {msg}");
    std::process::exit(1);
}

async fn run(cli: Cli) -> Result<()> {
    let topo = Topology::parse_file(
        &cli.topology,
        Options {
            auto_mgmt: cli.automgmt,
        },
    )
    .with_context(|| format!("parse {}", cli.topology))?;

    let mut runner = Runner::new()
        .with_connect_uri(cli.connect)
        .with_name_prefix(cli.nameprefix)
        .with_mac_base(cli.macbase)
        .with_tunnel_ip(cli.tunnelip)
        .with_port_base(cli.portbase)
        .with_port_gap(cli.portgap)
        .with_storage_pool(cli.pool);
    if let Some(addr) = cli.bmcaddr {
        runner = runner.with_bmc_addr(addr);
    }
    if let Some(dir) = cli.configdir {
        runner = runner.with_config_dir(dir);
    }
    if let Some(file) = cli.writesshconfig {
        runner = runner.write_ssh_config(file);
    }
    if let Some(file) = cli.writebmcconfig {
        runner = runner.write_bmc_config(file);
    }

    if cli.destroy {
        return runner.destroy(&topo).await;
    }

    runner = runner.with_authorized_keys(load_ssh_public_keys()?);
    runner.run(&topo).await
}

/// Collect the user's SSH public keys (~/.ssh/id_*.pub) for injection into
/// the started guests.
fn load_ssh_public_keys() -> Result<Vec<String>> {
    let Some(home) = std::env::var_os("HOME") else {
        return Ok(Vec::new());
    };
    let dot_ssh = Path::new(&home).join(".ssh");
    let entries = match std::fs::read_dir(&dot_ssh) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dot_ssh.display())),
    };

    let mut keys = Vec::new();
    for entry in entries {
        let entry = entry.context("read ~/.ssh")?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("id_") || !name.ends_with(".pub") {
            continue;
        }
        let key = std::fs::read_to_string(entry.path())
            .with_context(|| format!("read {}", entry.path().display()))?;
        keys.push(key.trim_end().to_string());
    }
    keys.sort();
    Ok(keys)
}
