use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Monotonic counter so concurrent writers to the same path never collide
/// on the temp filename.
static TMP_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Serialises `value` as pretty-printed, two-space-indented JSON and writes
/// it atomically: write to `<path>.tmp.<monotonic>`, fsync, rename over the
/// target. On any failure the temp file is removed. File mode is `0o600`.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value).context("serialising JSON")?;
    write_bytes_atomic(path, &body).await
}

pub async fn write_bytes_atomic(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating parent dir for {}", path.display()))?;
    }

    let counter = TMP_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let tmp_path = path.with_extension(format!(
        "{}.tmp.{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json"),
        counter
    ));

    let result = write_then_rename(&tmp_path, path, body).await;
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

async fn write_then_rename(tmp_path: &Path, target: &Path, body: &[u8]) -> Result<()> {
    let mut file = fs::File::create(tmp_path)
        .await
        .with_context(|| format!("creating temp file {}", tmp_path.display()))?;
    file.write_all(body).await.context("writing temp file")?;
    file.sync_all().await.context("fsync temp file")?;
    set_owner_only_permissions(tmp_path).await?;
    drop(file);
    fs::rename(tmp_path, target)
        .await
        .with_context(|| format!("renaming {} to {}", tmp_path.display(), target.display()))?;
    Ok(())
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms)
        .await
        .with_context(|| format!("setting permissions on {}", path.display()))
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &json!({"a": 1})).await.unwrap();
        let raw = fs::read_to_string(&path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[tokio::test]
    async fn no_leftover_tmp_file_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &json!({"a": 1})).await.unwrap();
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert_eq!(entry.file_name(), "state.json");
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn written_file_has_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &json!({"a": 1})).await.unwrap();
        let meta = fs::metadata(&path).await.unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
