use cachesync_lib::logging;
use cachesync_lib::{CacheSync, RemoteId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const USAGE: &str = "commands: pull <remote> <path> | adopt <remote> <path> | push <path> | \
force <path> | retarget <path> <remote> | delete <path> | remove <path> | list | clear | cancel | save | quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(CacheSync::default_config_dir);
    std::fs::create_dir_all(&config_dir)?;

    // 初始化日志系统
    let _log_guard = logging::init(&config_dir);

    let service = Arc::new(CacheSync::open(&config_dir).await?);
    let report = service.restore_state().await?;
    tracing::info!("启动完成，恢复 {} 个条目", report.restored);
    service.start();

    if let Some(mut notifications) = service.take_notifications() {
        tokio::spawn(async move {
            while let Some(n) = notifications.recv().await {
                match serde_json::to_string(&n) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("通知序列化失败: {}", e),
                }
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_command(&service, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("读取命令失败: {}", e);
                    break;
                }
            },
        }
    }

    let saved = service.shutdown().await?;
    tracing::info!("已退出，保存 {} 个条目", saved);
    Ok(())
}

/// 执行一行命令，返回 false 表示退出
async fn handle_command(service: &CacheSync, line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let result: anyhow::Result<String> = match parts.as_slice() {
        [] => return true,
        ["quit"] | ["exit"] => return false,
        ["pull", remote, path] => service
            .pull(&RemoteId::from(*remote), Path::new(path))
            .await
            .map(|hash| format!("pulled {}", hash))
            .map_err(Into::into),
        ["adopt", remote, path] => service
            .adopt(&RemoteId::from(*remote), Path::new(path))
            .await
            .map(|hash| format!("adopted {}", hash))
            .map_err(Into::into),
        ["push", path] => service
            .push(Path::new(path))
            .await
            .map(|o| format!("{:?}", o))
            .map_err(Into::into),
        ["force", path] => service
            .force_push(Path::new(path))
            .await
            .map(|o| format!("{:?}", o))
            .map_err(Into::into),
        ["retarget", path, remote] => service
            .retarget(Path::new(path), &RemoteId::from(*remote))
            .await
            .map(|o| format!("{:?}", o))
            .map_err(Into::into),
        ["delete", path] => service
            .confirm_delete(Path::new(path))
            .await
            .map(|_| "deleted".to_string())
            .map_err(Into::into),
        ["remove", path] => service
            .remove(Path::new(path))
            .map(|e| (if e.is_some() { "removed" } else { "not tracked" }).to_string())
            .map_err(Into::into),
        ["list"] => Ok(service
            .mru()
            .into_iter()
            .map(|(remote, path)| format!("{}\t{}", path.display(), remote))
            .collect::<Vec<_>>()
            .join("\n")),
        ["clear"] => service
            .clear()
            .await
            .map(|n| format!("cleared {}", n))
            .map_err(Into::into),
        ["cancel"] => {
            service.cancel();
            Ok("cancelled".to_string())
        }
        ["save"] => service
            .save_state()
            .map(|n| format!("saved {}", n))
            .map_err(Into::into),
        _ => Ok(USAGE.to_string()),
    };

    match result {
        Ok(out) if !out.is_empty() => println!("{}", out),
        Ok(_) => {}
        Err(e) => eprintln!("error: {}", e),
    }
    true
}
