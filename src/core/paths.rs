use std::path::{Component, Path, PathBuf};

/// 规范化跟踪路径：转为绝对路径并去掉 `.`/`..`，重复的分隔符由 `components()` 合并
pub fn normalize_path(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}
