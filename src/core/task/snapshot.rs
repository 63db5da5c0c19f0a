use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::chunk_manager::ChunkPlan;
use super::state::DownloadState;
use crate::core::error::{DownloadError, DownloadResult};

/// 下载快照，持久化后可以在不重新探测服务器的情况下恢复下载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    pub total_size: u64,
    /// 生成快照时每个分块的长度（最后一块可能更短），0 表示沿用当前配置
    #[serde(default)]
    pub chunk_size: u64,
    /// 分块序号 -> 已下载字节数
    pub chunk_progress: BTreeMap<usize, u64>,
    pub state: DownloadState,
}

impl DownloadSnapshot {
    pub fn downloaded_bytes(&self) -> u64 {
        self.chunk_progress.values().sum()
    }

    /// 按快照记录的分块长度重建分块计划
    pub fn plan(&self, fallback_chunk_size: u64, fallback_min_size: u64) -> DownloadResult<ChunkPlan> {
        let plan = if self.chunk_size > 0 {
            ChunkPlan::new(self.total_size, self.chunk_size, 0)
        } else {
            ChunkPlan::new(self.total_size, fallback_chunk_size, fallback_min_size)
        };
        let plan = plan.map_err(|e| DownloadError::Snapshot(e.to_string()))?;
        self.validate(&plan)?;
        plan.with_progress(&self.chunk_progress)
    }

    /// 检查快照和分块计划是否一致：每块记录的字节数不超过该块长度
    pub fn validate(&self, plan: &ChunkPlan) -> DownloadResult<()> {
        if self.id.trim().is_empty() {
            return Err(DownloadError::Snapshot("id 不能为空".to_string()));
        }
        if self.total_size == 0 {
            return Err(DownloadError::Snapshot("文件大小必须大于0".to_string()));
        }
        if plan.total_size() != self.total_size {
            return Err(DownloadError::Snapshot(format!(
                "文件大小不一致: 快照 {}, 计划 {}",
                self.total_size,
                plan.total_size()
            )));
        }
        for (&index, &bytes) in &self.chunk_progress {
            match plan.chunks().get(index) {
                Some(chunk) if bytes <= chunk.len() => {}
                Some(chunk) => {
                    return Err(DownloadError::Snapshot(format!(
                        "分块 {} 记录了 {} 字节, 超过分块长度 {}",
                        index,
                        bytes,
                        chunk.len()
                    )))
                }
                None => {
                    return Err(DownloadError::Snapshot(format!("分块序号 {} 不存在", index)))
                }
            }
        }
        Ok(())
    }
}
