//! Image tarball plumbing.
//!
//! The local image variant commits staged state by rewriting a daemon image
//! export (docker-save layout: `manifest.json`, a config JSON, and one
//! `layer.tar` per layer) and loading the result back. The helpers here do
//! the archive-level work; layer bookkeeping stays in the image variants.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tar::{Archive, Builder};

use kiln_core::error::{KilnError, Result};

/// One entry of a docker-save `manifest.json`.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// A daemon image export unpacked to disk.
#[derive(Debug)]
pub struct ExportedImage {
    /// Image config as raw JSON.
    pub config: serde_json::Value,
    /// Layer tarballs on disk, bottom to top.
    pub layer_paths: Vec<PathBuf>,
}

impl ExportedImage {
    /// Unpack an exported image tarball into `dest` and locate its config
    /// and layers.
    pub fn unpack(tar_path: &Path, dest: &Path) -> Result<Self> {
        std::fs::create_dir_all(dest)?;
        let file = File::open(tar_path)?;
        let mut archive = Archive::new(file);
        archive.unpack(dest)?;

        let manifest_raw = std::fs::read_to_string(dest.join("manifest.json"))?;
        let mut manifest: Vec<ManifestEntry> = serde_json::from_str(&manifest_raw)?;
        if manifest.is_empty() {
            return Err(KilnError::Docker(
                "image export has an empty manifest".to_string(),
            ));
        }
        let entry = manifest.remove(0);

        let config_raw = std::fs::read_to_string(dest.join(&entry.config))?;
        let config: serde_json::Value = serde_json::from_str(&config_raw)?;
        let layer_paths = entry.layers.iter().map(|l| dest.join(l)).collect();

        Ok(Self {
            config,
            layer_paths,
        })
    }

    /// Rootfs diff-ids, bottom to top.
    pub fn diff_ids(&self) -> Result<Vec<String>> {
        let ids = self.config["rootfs"]["diff_ids"]
            .as_array()
            .ok_or_else(|| KilnError::Docker("image config has no rootfs.diff_ids".to_string()))?;
        Ok(ids
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect())
    }
}

/// Write a loadable image tarball: the given config, the layer files in
/// order, and a manifest tying them together under `repo_tag`.
pub fn assemble(
    config: &serde_json::Value,
    layer_paths: &[PathBuf],
    repo_tag: &str,
    out: &Path,
) -> Result<()> {
    let file = File::create(out)?;
    let mut builder = Builder::new(file);

    let config_bytes = serde_json::to_vec(config)?;
    append_bytes(&mut builder, "config.json", &config_bytes)?;

    let mut layer_entries = Vec::with_capacity(layer_paths.len());
    for (i, path) in layer_paths.iter().enumerate() {
        let entry = format!("{i}/layer.tar");
        let mut layer = File::open(path)?;
        builder.append_file(&entry, &mut layer)?;
        layer_entries.push(entry);
    }

    let manifest = serde_json::json!([{
        "Config": "config.json",
        "RepoTags": [repo_tag],
        "Layers": layer_entries,
    }]);
    append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&manifest)?)?;

    builder.finish()?;
    Ok(())
}

fn append_bytes(builder: &mut Builder<File>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)?;
    Ok(())
}

/// Decompress a gzipped tarball to a raw tarball.
pub fn gunzip(src: &Path, dest: &Path) -> Result<()> {
    let mut decoder = GzDecoder::new(File::open(src)?);
    let mut out = File::create(dest)?;
    std::io::copy(&mut decoder, &mut out)?;
    out.flush()?;
    Ok(())
}

/// Package a directory as a gzipped tarball rooted at `prefix`.
pub fn targz_dir(src: &Path, prefix: &str, dest: &Path) -> Result<()> {
    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.append_dir_all(prefix, src)?;
    builder.into_inner()?.finish()?.flush()?;
    Ok(())
}

/// Diff-id of a gzipped layer tarball: the digest of its decompressed
/// content.
pub fn diff_id_of(tarball: &Path) -> Result<String> {
    let mut decoder = GzDecoder::new(File::open(tarball)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Digest of a byte slice, `sha256:`-prefixed.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}
