//! Base image acquisition and per-device volume management.
//!
//! Base OS images are fetched over HTTP into storage-pool volumes, one
//! concurrent fetch per distinct URL. Every device then gets a qcow2
//! copy-on-write child of its base image, or a standalone blank disk when
//! the topology asks for one.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;

use crate::utils::{self, CancelSignal};
use crate::virsh::Virsh;

use super::Runner;

/// A base OS image present as a volume in the storage pool.
#[derive(Debug, Clone)]
pub(crate) struct BaseImage {
    pub name: String,
    pub capacity: u64,
    pub path: Utf8PathBuf,
}

fn volume_xml(name: &str, capacity: u64, backing: Option<&Utf8Path>) -> String {
    let backing = match backing {
        Some(path) => format!(
            "  <backingStore>\n    <path>{path}</path>\n    <format type='qcow2'/>\n  </backingStore>\n"
        ),
        None => String::new(),
    };
    format!(
        r#"<volume>
  <name>{name}</name>
  <capacity unit='bytes'>{capacity}</capacity>
  <target>
    <format type='qcow2'/>
    <permissions>
      <mode>0664</mode>
    </permissions>
  </target>
{backing}</volume>
"#
    )
}

/// Derives the pool volume name for an image URL: the final path segment.
fn volume_name_for_url(image_url: &str) -> Result<String> {
    let u = url::Url::parse(image_url).with_context(|| format!("parse url {image_url}"))?;
    let name = u
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| eyre!("cannot derive volume name from {image_url}"))?;
    Ok(name.to_string())
}

/// Ensure a base image volume exists for every referenced OS image,
/// fetching the missing ones concurrently. The first failure cancels the
/// remaining fetches; the stage drains every worker before returning.
/// Completed volumes are kept either way, they are reusable.
pub(crate) async fn download_base_images(r: &mut Runner) -> Result<()> {
    r.virsh.check_pool(&r.pool).await?;

    let mut have = std::collections::BTreeMap::new();
    let mut want = std::collections::BTreeMap::new();
    for d in r.devices.values() {
        let Some(image_url) = d.topo.os_image() else {
            continue;
        };
        if have.contains_key(image_url) || want.contains_key(image_url) {
            continue;
        }
        let name = volume_name_for_url(image_url)?;
        match r.virsh.vol_lookup(&r.pool, &name).await? {
            Some(info) => {
                have.insert(
                    image_url.to_string(),
                    BaseImage {
                        name,
                        capacity: info.capacity,
                        path: info.path,
                    },
                );
            }
            None => {
                want.insert(image_url.to_string(), name);
            }
        }
    }

    let client = reqwest::Client::builder()
        .build()
        .context("init http client")?;
    let (cancel_tx, cancel_rx) = utils::cancellation();
    let mut workers = JoinSet::new();
    for (image_url, name) in want {
        workers.spawn(fetch_base_image(
            r.virsh.clone(),
            client.clone(),
            r.pool.clone(),
            image_url,
            name,
            cancel_rx.clone(),
        ));
    }

    let mut first_err: Option<color_eyre::Report> = None;
    while let Some(res) = workers.join_next().await {
        let mut record_err = |err: color_eyre::Report| {
            cancel_tx.cancel();
            if first_err.is_none() {
                first_err = Some(err);
            }
        };
        match res {
            Ok(Ok((image_url, image))) => {
                have.insert(image_url, image);
            }
            Ok(Err(err)) => record_err(err),
            Err(join_err) => record_err(eyre!("image fetch worker: {join_err}")),
        }
    }
    if let Some(err) = first_err {
        return Err(err.wrap_err("download base images"));
    }

    r.base_images = have;
    Ok(())
}

async fn fetch_base_image(
    virsh: Virsh,
    client: reqwest::Client,
    pool: String,
    image_url: String,
    name: String,
    mut cancel: CancelSignal,
) -> Result<(String, BaseImage)> {
    let size = tokio::select! {
        _ = cancel.canceled() => return Err(eyre!("fetch {image_url}: canceled")),
        res = fetch_content_length(&client, &image_url) => res?,
    };

    virsh
        .vol_create(&pool, &volume_xml(&name, size, None))
        .await
        .with_context(|| format!("vol-create {name}"))?;

    // The volume exists from here on; failure and cancellation both have
    // to remove the partial volume before reporting.
    let fetched = tokio::select! {
        _ = cancel.canceled() => Err(eyre!("canceled")),
        res = fetch_image_to_spool(&client, &image_url) => res,
    };
    let uploaded = match fetched {
        Ok(spool) => match spool.path().to_str() {
            Some(path) => virsh
                .vol_upload(&pool, &name, path)
                .await
                .wrap_err_with(|| format!("vol-upload {name}")),
            None => Err(eyre!("non-UTF-8 spool path")),
        },
        Err(err) => Err(err),
    };

    match uploaded {
        Ok(()) => {
            let info = virsh
                .vol_lookup(&pool, &name)
                .await?
                .ok_or_else(|| eyre!("uploaded volume {name} disappeared"))?;
            Ok((
                image_url,
                BaseImage {
                    name,
                    capacity: info.capacity,
                    path: info.path,
                },
            ))
        }
        Err(err) => {
            if let Err(del_err) = virsh.vol_delete(&pool, &name).await {
                tracing::warn!("delete partial volume {name}: {del_err:#}");
            }
            Err(err.wrap_err(format!("fetch {image_url}")))
        }
    }
}

async fn fetch_content_length(client: &reqwest::Client, image_url: &str) -> Result<u64> {
    let resp = client
        .head(image_url)
        .send()
        .await
        .with_context(|| format!("fetch image size ({image_url})"))?;
    if !resp.status().is_success() {
        return Err(eyre!("status {} ({image_url})", resp.status()));
    }
    // Read the header directly; a HEAD response has no body to size.
    resp.headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| eyre!("no content length ({image_url})"))
}

// Spools the image into a temp file; virsh vol-upload reads from a file,
// not from a pipe.
async fn fetch_image_to_spool(
    client: &reqwest::Client,
    image_url: &str,
) -> Result<tempfile::NamedTempFile> {
    let mut resp = client
        .get(image_url)
        .send()
        .await
        .with_context(|| format!("fetch image ({image_url})"))?;
    if !resp.status().is_success() {
        return Err(eyre!("status {} ({image_url})", resp.status()));
    }
    let spool = tempfile::Builder::new()
        .prefix("runtopo-image.")
        .tempfile()
        .context("create spool file")?;
    let mut file = tokio::fs::File::from_std(spool.reopen().context("reopen spool file")?);
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await.context("write spool file")?;
    }
    file.flush().await?;
    Ok(spool)
}

/// Create the per-device volumes: copy-on-write children of the base
/// images, or standalone blank disks for devices with os=none. On error,
/// every volume created by this invocation is deleted again; volumes left
/// over from earlier runs are not touched.
pub(crate) async fn create_volumes(r: &Runner) -> Result<()> {
    let mut created: Vec<String> = Vec::new();
    if let Err(err) = create_volumes_inner(r, &mut created).await {
        for name in created {
            if let Err(del_err) = r.virsh.vol_delete(&r.pool, &name).await {
                tracing::warn!("rollback vol-delete {name}: {del_err:#}");
            }
        }
        return Err(err.wrap_err("create volumes"));
    }
    Ok(())
}

async fn create_volumes_inner(r: &Runner, created: &mut Vec<String>) -> Result<()> {
    for d in r.devices.values() {
        let xml = match d.topo.os_image() {
            Some(image_url) => {
                let base = r
                    .base_images
                    .get(image_url)
                    .ok_or_else(|| eyre!("device {}: missing base image {image_url}", d.name))?;
                volume_xml(&d.name, base.capacity, Some(&base.path))
            }
            None => volume_xml(&d.name, d.topo.disk_size(), None),
        };
        r.virsh
            .vol_create(&d.pool, &xml)
            .await
            .wrap_err_with(|| format!("vol-create {}", d.name))?;
        created.push(d.name.clone());
    }
    Ok(())
}

/// Remove the per-device volumes. Best-effort: missing volumes are
/// ignored, other failures only log. Base images are never deleted.
pub(crate) async fn delete_volumes(r: &Runner) -> Result<()> {
    for d in r.devices.values() {
        if r.virsh.vol_lookup(&r.pool, &d.name).await?.is_none() {
            continue;
        }
        if let Err(err) = r.virsh.vol_delete(&r.pool, &d.name).await {
            tracing::warn!("vol-delete {}: {err:#}", d.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_names_derive_from_url_basename() {
        let name = volume_name_for_url(
            "https://example.com/pub/images/Fedora-Cloud-Base-33-1.2.x86_64.qcow2?foo=1",
        )
        .unwrap();
        assert_eq!(name, "Fedora-Cloud-Base-33-1.2.x86_64.qcow2");

        assert!(volume_name_for_url("https://example.com/").is_err());
        assert!(volume_name_for_url("not a url").is_err());
    }

    #[test]
    fn volume_xml_with_backing_store() {
        let xml = volume_xml(
            "runtopo-leaf0",
            6 << 30,
            Some(Utf8Path::new("/var/lib/libvirt/images/base.qcow2")),
        );
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let root = doc.root_element();
        assert_eq!(
            root.children()
                .find(|n| n.has_tag_name("name"))
                .and_then(|n| n.text()),
            Some("runtopo-leaf0")
        );
        assert_eq!(
            root.children()
                .find(|n| n.has_tag_name("capacity"))
                .and_then(|n| n.text()),
            Some("6442450944")
        );
        let backing = root
            .children()
            .find(|n| n.has_tag_name("backingStore"))
            .expect("no backingStore");
        assert_eq!(
            backing
                .children()
                .find(|n| n.has_tag_name("path"))
                .and_then(|n| n.text()),
            Some("/var/lib/libvirt/images/base.qcow2")
        );
    }

    #[test]
    fn blank_volume_has_no_backing_store() {
        let xml = volume_xml("runtopo-host0", 8 << 30, None);
        let doc = roxmltree::Document::parse(&xml).unwrap();
        assert!(!doc.descendants().any(|n| n.has_tag_name("backingStore")));
    }
}
