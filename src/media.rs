use crate::protocol::MediaKind;
use anyhow::{Result, anyhow};
use log::debug;
use std::path::PathBuf;
use tokio::fs;

/// Persists downloaded media binaries under one subdirectory per kind and
/// hands back the relative url the CRM serves them under.
pub struct MediaStore {
    base_dir: PathBuf,
}

impl MediaStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn sanitize_filename(key: &str) -> String {
        key.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-', "_")
    }

    pub async fn save(&self, kind: MediaKind, external_id: &str, bytes: &[u8]) -> Result<String> {
        if bytes.is_empty() {
            return Err(anyhow!("empty media buffer"));
        }

        let folder = kind.folder();
        let file_name = format!(
            "{}{}",
            Self::sanitize_filename(external_id),
            kind.extension()
        );
        let dir = self.base_dir.join(folder);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(&file_name), bytes).await?;

        let url = format!("/media/{folder}/{file_name}");
        debug!(target: "Media", "saved {} bytes to {url}", bytes.len());
        Ok(url)
    }
}
