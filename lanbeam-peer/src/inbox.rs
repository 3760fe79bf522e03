//! Writes received files into the download directory.

use std::path::{Path, PathBuf};

use anyhow::Context;
use lanbeam_core::Delivery;

/// `dir/name`, or `dir/stem (n).ext` for the first free `n` when taken.
/// Only the final component of `name` is used.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| "received".to_string());
    let candidate = dir.join(&base);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match base.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s.to_string(), format!(".{e}")),
        _ => (base.clone(), String::new()),
    };
    (1..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

pub async fn save(dir: &Path, delivery: &Delivery) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = unique_path(dir, &delivery.key.file_name);
    tokio::fs::write(&path, &delivery.payload)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
