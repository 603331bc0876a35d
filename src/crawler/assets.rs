//! On-disk copies of downloaded assets
//!
//! Files are content-addressed (`<sha256>.<ext>`), so the same image linked
//! from many pages is written once.

use crate::crawler::extractor::Entity;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AssetStore {
    dir: PathBuf,
}

impl AssetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes an asset's bytes and returns the file name inside the store
    ///
    /// The write goes through a temporary file and a rename, so a crash never
    /// leaves a truncated file under the final name.
    pub async fn save(&self, asset: &Entity, body: &[u8]) -> io::Result<String> {
        let digest = match asset.fields.get("sha256") {
            Some(digest) => digest.clone(),
            None => hex::encode(Sha256::digest(body)),
        };
        let extension = extension(
            asset.fields.get("content-type").map(String::as_str),
            asset.fields.get("name").map(String::as_str),
        );
        let file_name = format!("{}.{}", digest, extension);
        let path = self.dir.join(&file_name);

        if tokio::fs::try_exists(&path).await? {
            return Ok(file_name);
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let partial = self.dir.join(format!("{}.part", file_name));
        tokio::fs::write(&partial, body).await?;
        tokio::fs::rename(&partial, &path).await?;

        tracing::debug!("Stored asset {} as {}", asset.key, path.display());
        Ok(file_name)
    }
}

fn extension(content_type: Option<&str>, name: Option<&str>) -> String {
    let known = match content_type.unwrap_or_default() {
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/svg+xml" => Some("svg"),
        "image/x-icon" | "image/vnd.microsoft.icon" => Some("ico"),
        "application/pdf" => Some("pdf"),
        "application/zip" => Some("zip"),
        _ => None,
    };
    if let Some(known) = known {
        return known.to_string();
    }

    name.and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| {
            (1..=5).contains(&ext.len()) && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        })
        .unwrap_or_else(|| "bin".to_string())
}
