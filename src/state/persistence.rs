//! 对话状态持久化
//!
//! 每轮结束后把 DialogueState 写入 JSON 快照，进程重启后可恢复同一会话。

use std::path::{Path, PathBuf};

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::DialogueState;

/// 快照格式版本
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: DialogueState,
}

/// 单文件 JSON 持久化
#[derive(Debug, Clone)]
pub struct StatePersistence {
    path: PathBuf,
}

impl StatePersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载快照；文件不存在时返回空状态
    pub fn load(&self) -> anyhow::Result<DialogueState> {
        if !self.path.exists() {
            return Ok(DialogueState::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let snapshot: SessionSnapshot = serde_json::from_str(&data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            bail!(
                "Unsupported snapshot version {} in {}",
                snapshot.version,
                self.path.display()
            );
        }
        Ok(snapshot.state)
    }

    /// 写入快照；父目录不存在时自动创建
    pub fn save(&self, state: &DialogueState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = SessionSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            state: state.clone(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }
}
