//! Small helpers shared across the crate: natural string ordering, MAC
//! address arithmetic, random credentials, and external-command plumbing.

use std::cmp::Ordering;
use std::process::Stdio;

use color_eyre::eyre::{eyre, Context, Result};
use macaddr::MacAddr6;
use rand::RngCore;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;

/// Compare two strings using Dave Koelle's Alphanum algorithm: the inputs
/// are split into alternating runs of digits and non-digits, digit runs
/// compare as unsigned integers and everything else by byte value.
pub fn nat_compare(s: &str, t: &str) -> Ordering {
    let (mut s, mut t) = (s.as_bytes(), t.as_bytes());
    while !s.is_empty() && !t.is_empty() {
        let (cs, rest_s) = next_chunk(s);
        let (ct, rest_t) = next_chunk(t);
        s = rest_s;
        t = rest_t;

        if cs[0].is_ascii_digit() && ct[0].is_ascii_digit() {
            match compare_digit_runs(cs, ct) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        match cs.cmp(ct) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    s.len().cmp(&t.len())
}

fn next_chunk(s: &[u8]) -> (&[u8], &[u8]) {
    let digits = s[0].is_ascii_digit();
    let end = s
        .iter()
        .position(|c| c.is_ascii_digit() != digits)
        .unwrap_or(s.len());
    s.split_at(end)
}

// Numeric comparison without parsing: strip leading zeros, then a longer
// run is larger and equal-length runs compare bytewise.
fn compare_digit_runs(a: &[u8], b: &[u8]) -> Ordering {
    let trim = |s: &[u8]| {
        let start = s.iter().position(|&c| c != b'0').unwrap_or(s.len());
        s[start..].to_vec()
    };
    let (a, b) = (trim(a), trim(b));
    a.len().cmp(&b.len()).then_with(|| a.cmp(&b))
}

/// Generate a printable random string of length n.
pub fn random_string(n: usize) -> String {
    let mut scratch = vec![0u8; (n + 3) / 4 * 3];
    rand::rng().fill_bytes(&mut scratch);
    let mut s = data_encoding::BASE64URL.encode(&scratch);
    s.truncate(n);
    s
}

/// Format a MAC address the way udev and dnsmasq expect it: lowercase hex,
/// colon-separated. udev's ATTR{address} match is case-sensitive, so this
/// must not go through a Display impl with different casing.
pub fn format_mac(mac: &MacAddr6) -> String {
    let b = mac.as_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

/// Widen a MAC address to the integer it encodes.
pub fn mac_to_u64(mac: &MacAddr6) -> u64 {
    mac.as_bytes()
        .iter()
        .fold(0u64, |acc, &b| acc << 8 | u64::from(b))
}

/// Inverse of [`mac_to_u64`].
///
/// Panics when x does not fit an EUI-48; callers derive x from a parsed MAC
/// plus a per-link increment, so hitting this means the topology exhausted
/// the 48-bit space.
pub fn mac_from_u64(x: u64) -> MacAddr6 {
    assert!(x >> 48 == 0, "invalid EUI-48: {x:#x}");
    let b = x.to_be_bytes();
    MacAddr6::new(b[2], b[3], b[4], b[5], b[6], b[7])
}

/// Write p to a new temporary file and return its handle. The file is
/// removed when the handle drops.
pub fn temp_file_with(prefix: &str, p: &[u8]) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut fd = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile()
        .context("create temp file")?;
    fd.write_all(p).context("write temp file")?;
    fd.flush().context("flush temp file")?;
    Ok(fd)
}

/// Run the command to completion and return its stdout. A non-zero exit
/// becomes an error carrying the command's stderr verbatim.
pub async fn output_checked(cmd: &mut Command) -> Result<Vec<u8>> {
    cmd.kill_on_drop(true);
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let out = cmd
        .output()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(eyre!("{program}: {} ({})", out.status, stderr.trim()));
    }
    Ok(out.stdout)
}

/// Like [`output_checked`], but feeds input to the child's stdin first.
pub async fn output_checked_with_stdin(cmd: &mut Command, input: &[u8]) -> Result<Vec<u8>> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to run {program}"))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| eyre!("{program}: stdin not captured"))?;
    stdin
        .write_all(input)
        .await
        .with_context(|| format!("{program}: write stdin"))?;
    drop(stdin);
    let out = child
        .wait_with_output()
        .await
        .with_context(|| format!("{program}: wait"))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(eyre!("{program}: {} ({})", out.status, stderr.trim()));
    }
    Ok(out.stdout)
}

/// Create a linked cancellation pair for one fan-out stage. Every worker
/// holds a clone of the [`CancelSignal`]; the stage cancels the
/// [`CancelSource`] after the first failure and keeps collecting results
/// until all workers returned.
pub fn cancellation() -> (CancelSource, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelSignal { rx })
}

/// The stage-side half of a cancellation pair.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// The worker-side half of a cancellation pair.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Completes once the stage has been canceled. Never completes if the
    /// source is dropped without canceling.
    pub async fn canceled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
