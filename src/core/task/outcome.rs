use std::path::PathBuf;
use std::sync::Arc;

use crate::core::error::DownloadError;

/// 单个分块任务的结果
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    /// 仅在成功时存在
    pub temp_path: Option<PathBuf>,
    pub bytes_downloaded: u64,
    pub success: bool,
    pub error: Option<Arc<DownloadError>>,
}

impl ChunkOutcome {
    pub fn success(chunk_index: usize, temp_path: PathBuf, bytes_downloaded: u64) -> Self {
        Self {
            chunk_index,
            temp_path: Some(temp_path),
            bytes_downloaded,
            success: true,
            error: None,
        }
    }

    pub fn failure(chunk_index: usize, error: DownloadError, bytes_downloaded: u64) -> Self {
        Self {
            chunk_index,
            temp_path: None,
            bytes_downloaded,
            success: false,
            error: Some(Arc::new(error)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_deref().is_some_and(DownloadError::is_cancelled)
    }

    /// 失败原因，成功时为 `None`
    pub fn cause(&self) -> Option<Arc<DownloadError>> {
        if self.success {
            return None;
        }
        Some(
            self.error
                .clone()
                .unwrap_or_else(|| Arc::new(DownloadError::Assembly(format!("分块 {} 失败但没有记录原因", self.chunk_index)))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_constructors() {
        let ok = ChunkOutcome::success(1, PathBuf::from("/tmp/chunk1.bin"), 42);
        assert!(ok.success);
        assert!(ok.cause().is_none());
        assert_eq!(ok.temp_path.as_deref(), Some(std::path::Path::new("/tmp/chunk1.bin")));

        let cancelled = ChunkOutcome::failure(2, DownloadError::Cancelled, 7);
        assert!(!cancelled.success);
        assert!(cancelled.temp_path.is_none());
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.bytes_downloaded, 7);
        assert!(cancelled.cause().is_some());
    }
}
