use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 下载状态
///
/// `Pending → Downloading → {Paused, Completed, Failed, Cancelled, Stopped}`，
/// `Paused → {Downloading, Cancelled, Stopped}`。
/// `Stopped` 对当前实例是终态，但其快照可以重建出新的 `Pending` 下载。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadState {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Stopped,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed
                | DownloadState::Failed
                | DownloadState::Cancelled
                | DownloadState::Stopped
        )
    }

    /// 是否仍有分块任务在运行（包括暂停中的）
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadState::Downloading | DownloadState::Paused)
    }

    pub fn can_transition_to(&self, next: DownloadState) -> bool {
        use DownloadState::*;
        match (self, next) {
            (Pending, Downloading) => true,
            (Downloading, Paused | Completed | Failed | Cancelled | Stopped) => true,
            (Paused, Downloading | Cancelled | Stopped) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Pending => "PENDING",
            DownloadState::Downloading => "DOWNLOADING",
            DownloadState::Paused => "PAUSED",
            DownloadState::Completed => "COMPLETED",
            DownloadState::Failed => "FAILED",
            DownloadState::Cancelled => "CANCELLED",
            DownloadState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DownloadState::Pending),
            "DOWNLOADING" => Ok(DownloadState::Downloading),
            "PAUSED" => Ok(DownloadState::Paused),
            "COMPLETED" => Ok(DownloadState::Completed),
            "FAILED" => Ok(DownloadState::Failed),
            "CANCELLED" => Ok(DownloadState::Cancelled),
            "STOPPED" => Ok(DownloadState::Stopped),
            other => Err(format!("未知的下载状态: {}", other)),
        }
    }
}
