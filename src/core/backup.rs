//! 推送失败时的本地备份

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// 生成备份文件名: `<YYYYMMDDHHMMSS>-<原文件名>`
pub fn backup_name(file_name: &str, at: DateTime<Local>) -> String {
    format!("{}-{}", at.format("%Y%m%d%H%M%S"), file_name)
}

/// 同一秒内重复备份时的候选名：`<YYYYMMDDHHMMSS>-<序号>-<原文件名>`
fn numbered_name(file_name: &str, at: DateTime<Local>, n: u32) -> String {
    match n {
        0 => backup_name(file_name, at),
        _ => format!("{}-{}-{}", at.format("%Y%m%d%H%M%S"), n, file_name),
    }
}

/// 把缓存文件复制到备份目录，返回备份路径；不会覆盖已有备份
pub async fn backup_file(src: &Path, backup_dir: &Path) -> std::io::Result<PathBuf> {
    let file_name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());

    tokio::fs::create_dir_all(backup_dir).await?;
    let mut source = tokio::fs::File::open(src).await?;
    let at = Local::now();

    let mut n = 0;
    let (dest, mut target) = loop {
        let dest = backup_dir.join(numbered_name(&file_name, at, n));
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .await
        {
            Ok(file) => break (dest, file),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    };

    let copied = tokio::io::copy(&mut source, &mut target).await;
    if let Err(e) = copied.and(target.sync_all().await) {
        drop(target);
        let _ = tokio::fs::remove_file(&dest).await;
        return Err(e);
    }

    tracing::info!("已备份 {:?} -> {:?}", src, dest);
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_name_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(backup_name("notes.txt", at), "20240309070501-notes.txt");
    }

    #[tokio::test]
    async fn test_backup_copies_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("doc.md");
        std::fs::write(&src, b"unsaved").unwrap();

        let dest = backup_file(&src, &dir.path().join("backup")).await.unwrap();
        assert!(dest.file_name().unwrap().to_string_lossy().ends_with("-doc.md"));
        assert_eq!(std::fs::read(dest).unwrap(), b"unsaved");
    }

    #[test]
    fn test_numbered_name() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(numbered_name("notes.txt", at, 0), "20240309070501-notes.txt");
        assert_eq!(numbered_name("notes.txt", at, 2), "20240309070501-2-notes.txt");
    }

    #[tokio::test]
    async fn test_repeated_backups_do_not_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("doc.md");
        let backup_dir = dir.path().join("backup");

        std::fs::write(&src, b"first").unwrap();
        let first = backup_file(&src, &backup_dir).await.unwrap();
        std::fs::write(&src, b"second").unwrap();
        let second = backup_file(&src, &backup_dir).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
        assert_eq!(std::fs::read(&second).unwrap(), b"second");
    }
}
