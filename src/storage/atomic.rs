//! Atomic file write: write to a uniquely-named temp file in the same
//! directory, then rename over the target. On any failure the temp file is
//! removed so no `.tmp-*` litter survives a failed write.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

fn temp_path(target: &Path) -> Result<PathBuf> {
    let dir = target
        .parent()
        .context("target path has no parent directory")?;
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .context("target path has no file name")?;
    let rand: u32 = rand_u32();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    Ok(dir.join(format!(".{name}.tmp-{}-{t}-{rand}", std::process::id())))
}

fn rand_u32() -> u32 {
    // A lock file's own name already carries pid+timestamp; this only needs
    // to disambiguate same-pid-same-millisecond temp files, so a coarse
    // counter seeded from the address of a stack value is sufficient and
    // keeps this module dependency-free.
    use std::cell::Cell;
    thread_local! {
        static COUNTER: Cell<u32> = Cell::new(0);
    }
    COUNTER.with(|c| {
        let v = c.get().wrapping_add(1);
        c.set(v);
        v ^ (std::process::id())
    })
}

/// Atomically write `contents` to `target`.
pub async fn write(target: &Path, contents: &[u8]) -> Result<()> {
    let tmp = temp_path(target)?;
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, target).await?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result.with_context(|| format!("atomic write to {} failed", target.display()))
}

/// Append `contents` to `target`, creating it if absent. Not atomic in the
/// temp+rename sense (appends are the cheap path the prefix-extension rule
/// in §4.1 relies on); callers that need rewrite-safety use `write` instead.
pub async fn append(target: &Path, contents: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .await
        .with_context(|| format!("failed to open {} for append", target.display()))?;
    file.write_all(contents).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("record.json");
        write(&target, b"hello").await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"hello");

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1, "only the target file should remain");
    }

    #[tokio::test]
    async fn append_grows_file_without_touching_existing_bytes() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("log.jsonl");
        append(&target, b"line1\n").await.unwrap();
        append(&target, b"line2\n").await.unwrap();
        let contents = tokio::fs::read_to_string(&target).await.unwrap();
        assert_eq!(contents, "line1\nline2\n");
    }
}
