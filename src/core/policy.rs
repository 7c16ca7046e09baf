//! 推送检查模式与提供方策略表

use crate::storage::{RemoteId, TruncateStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// 推送前后的检查模式
///
/// `READ` 推送前比对远程哈希，`WRITE` 推送后延迟复查。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawCheckMode", into = "String")]
pub struct CheckMode(u8);

/// 配置中的检查模式：名称或 `0..=3` 数字
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCheckMode {
    Number(u64),
    Name(String),
}

impl CheckMode {
    pub const NONE: CheckMode = CheckMode(0);
    pub const READ: CheckMode = CheckMode(1);
    pub const WRITE: CheckMode = CheckMode(2);
    pub const READ_WRITE: CheckMode = CheckMode(3);

    pub fn reads(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn writes(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CheckMode {
    type Output = CheckMode;

    fn bitor(self, rhs: CheckMode) -> CheckMode {
        CheckMode(self.0 | rhs.0)
    }
}

impl fmt::Display for CheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0 => "NONE",
            1 => "READ",
            2 => "WRITE",
            _ => "READ_WRITE",
        };
        f.write_str(name)
    }
}

impl TryFrom<String> for CheckMode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.trim().to_uppercase().as_str() {
            "NONE" | "0" => Ok(CheckMode::NONE),
            "READ" | "1" => Ok(CheckMode::READ),
            "WRITE" | "2" => Ok(CheckMode::WRITE),
            "READ_WRITE" | "3" => Ok(CheckMode::READ_WRITE),
            other => Err(format!("未知的检查模式: {}", other)),
        }
    }
}

impl TryFrom<RawCheckMode> for CheckMode {
    type Error = String;

    fn try_from(raw: RawCheckMode) -> Result<Self, Self::Error> {
        match raw {
            RawCheckMode::Number(n @ 0..=3) => Ok(CheckMode(n as u8)),
            RawCheckMode::Number(n) => Err(format!("未知的检查模式: {}", n)),
            RawCheckMode::Name(name) => CheckMode::try_from(name),
        }
    }
}

impl From<CheckMode> for String {
    fn from(mode: CheckMode) -> Self {
        mode.to_string()
    }
}

/// 提供方类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderClass {
    Cloud,
    #[default]
    Other,
}

/// 按定位符前缀识别提供方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRule {
    pub prefix: String,
    #[serde(default)]
    pub class: ProviderClass,
    #[serde(default)]
    pub truncate: TruncateStrategy,
}

impl ProviderRule {
    fn new(prefix: &str, class: ProviderClass, truncate: TruncateStrategy) -> Self {
        Self {
            prefix: prefix.to_string(),
            class,
            truncate,
        }
    }
}

/// 单次操作使用的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderStrategy {
    pub class: ProviderClass,
    pub check_mode: CheckMode,
    pub truncate: TruncateStrategy,
}

/// 提供方策略表
#[derive(Debug, Clone)]
pub struct ProviderTable {
    rules: Vec<ProviderRule>,
    check_mode: CheckMode,
    cloud_check_mode: CheckMode,
}

impl ProviderTable {
    pub fn new(rules: Vec<ProviderRule>, check_mode: CheckMode, cloud_check_mode: CheckMode) -> Self {
        Self {
            rules,
            check_mode,
            cloud_check_mode,
        }
    }

    /// 内置规则：常见云文档提供方与对象存储
    pub fn default_rules() -> Vec<ProviderRule> {
        use ProviderClass::Cloud;
        use TruncateStrategy::{Channel, Reopen};

        vec![
            ProviderRule::new("content://com.dropbox", Cloud, Reopen),
            ProviderRule::new("content://com.google.android.apps.docs", Cloud, Reopen),
            // OneDrive 的写句柄不理会打开时的截断标志
            ProviderRule::new("content://com.microsoft.skydrive", Cloud, Channel),
            ProviderRule::new("s3://", Cloud, Reopen),
            ProviderRule::new("webdav://", Cloud, Reopen),
            ProviderRule::new("webdavs://", Cloud, Reopen),
        ]
    }

    /// 查找定位符对应的策略；强制覆盖时检查模式总是 `NONE`
    pub fn resolve(&self, remote: &RemoteId, force: bool) -> ProviderStrategy {
        let rule = self
            .rules
            .iter()
            .find(|r| remote.as_str().starts_with(&r.prefix));

        let class = rule.map(|r| r.class).unwrap_or_default();
        let truncate = rule.map(|r| r.truncate).unwrap_or_default();
        let check_mode = if force {
            CheckMode::NONE
        } else {
            match class {
                ProviderClass::Cloud => self.cloud_check_mode,
                ProviderClass::Other => self.check_mode,
            }
        };

        ProviderStrategy {
            class,
            check_mode,
            truncate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mode_bits() {
        assert_eq!(CheckMode::READ | CheckMode::WRITE, CheckMode::READ_WRITE);
        assert!(CheckMode::READ_WRITE.reads() && CheckMode::READ_WRITE.writes());
        assert!(!CheckMode::WRITE.reads());
        assert!(CheckMode::NONE.is_none());
    }

    #[test]
    fn test_check_mode_serde() {
        let mode: CheckMode = serde_json::from_str("\"read_write\"").unwrap();
        assert_eq!(mode, CheckMode::READ_WRITE);
        let mode: CheckMode = serde_json::from_str("\"2\"").unwrap();
        assert_eq!(mode, CheckMode::WRITE);
        assert_eq!(serde_json::to_string(&CheckMode::READ).unwrap(), "\"READ\"");
        assert!(serde_json::from_str::<CheckMode>("\"BOTH\"").is_err());

        let mode: CheckMode = serde_json::from_str("1").unwrap();
        assert_eq!(mode, CheckMode::READ);
        assert!(serde_json::from_str::<CheckMode>("4").is_err());
    }

    #[test]
    fn test_resolve_by_class() {
        let table = ProviderTable::new(
            ProviderTable::default_rules(),
            CheckMode::READ,
            CheckMode::READ_WRITE,
        );

        let onedrive = table.resolve(
            &RemoteId::new("content://com.microsoft.skydrive.content.external/doc/1"),
            false,
        );
        assert_eq!(onedrive.class, ProviderClass::Cloud);
        assert_eq!(onedrive.check_mode, CheckMode::READ_WRITE);
        assert_eq!(onedrive.truncate, TruncateStrategy::Channel);

        let local = table.resolve(&RemoteId::new("file:///tmp/a.txt"), false);
        assert_eq!(local.class, ProviderClass::Other);
        assert_eq!(local.check_mode, CheckMode::READ);
        assert_eq!(local.truncate, TruncateStrategy::Reopen);
    }

    #[test]
    fn test_force_resolves_to_none() {
        let table = ProviderTable::new(
            ProviderTable::default_rules(),
            CheckMode::READ_WRITE,
            CheckMode::READ_WRITE,
        );
        let s3 = table.resolve(&RemoteId::new("s3://bucket/a"), true);
        assert_eq!(s3.check_mode, CheckMode::NONE);
        assert_eq!(s3.class, ProviderClass::Cloud);
    }
}
