//! 同步通知 - 交给界面层处理的结构化事件

use crate::storage::RemoteId;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// 通知通道容量
pub const NOTIFICATION_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncNotification {
    /// 远程内容在上次同步后被修改，需要选择覆盖或改写到其他位置
    Conflict { path: PathBuf, remote: RemoteId },
    /// 写入后复查发现远程内容与本地不一致
    WriteIntegrityFailure { path: PathBuf, remote: RemoteId },
    /// 本地缓存文件被删除，等待确认是否删除远程文档
    DeleteConfirmationRequested { path: PathBuf, remote: RemoteId },
    /// 推送失败；`backup` 为空表示备份也失败了
    DataAtRiskWarning {
        path: PathBuf,
        backup: Option<PathBuf>,
    },
    RemoteUnreachable { path: PathBuf, remote: RemoteId },
}

/// 通知发送端
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<SyncNotification>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::Receiver<SyncNotification>) {
        let (tx, rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        (Self { tx }, rx)
    }

    /// 发送通知，不阻塞调用方
    pub fn send(&self, notification: SyncNotification) {
        tracing::debug!("发出通知: {:?}", notification);
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(n)) => {
                tracing::warn!("通知队列已满，丢弃: {:?}", n);
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                tracing::debug!("通知接收端已关闭: {:?}", n);
            }
        }
    }
}
