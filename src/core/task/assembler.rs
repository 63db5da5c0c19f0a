use log::{debug, info, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};

use super::outcome::ChunkOutcome;
use crate::core::error::{DownloadError, DownloadResult};

/// 分块合并器
#[derive(Debug, Clone)]
pub struct FileAssembler {
    buffer_size: usize,
}

impl Default for FileAssembler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BUFFER_SIZE)
    }
}

impl FileAssembler {
    pub const DEFAULT_BUFFER_SIZE: usize = 8192;

    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// 检查分块结果是否完整，返回按序号排好的临时文件路径
    ///
    /// 0 到最大序号之间的每个分块必须恰好出现一次且都成功。
    pub fn validate(outcomes: &[ChunkOutcome]) -> DownloadResult<Vec<PathBuf>> {
        let max_index = outcomes
            .iter()
            .map(|o| o.chunk_index)
            .max()
            .ok_or_else(|| DownloadError::Assembly("没有可合并的分块".to_string()))?;

        let mut slots: Vec<Option<&ChunkOutcome>> = vec![None; max_index + 1];
        for outcome in outcomes {
            let slot = &mut slots[outcome.chunk_index];
            if slot.is_some() {
                return Err(DownloadError::Assembly(format!("分块 {} 重复", outcome.chunk_index)));
            }
            *slot = Some(outcome);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                let outcome = slot.ok_or_else(|| DownloadError::Assembly(format!("分块 {} 缺失", index)))?;
                if !outcome.success {
                    let reason = outcome
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "未知错误".to_string());
                    return Err(DownloadError::Assembly(format!("分块 {} 下载失败: {}", index, reason)));
                }
                outcome
                    .temp_path
                    .clone()
                    .ok_or_else(|| DownloadError::Assembly(format!("分块 {} 没有临时文件", index)))
            })
            .collect()
    }

    /// 按序号把所有分块写入目标文件，成功后删除临时文件，返回写入的总字节数
    pub async fn assemble(&self, outcomes: &[ChunkOutcome], destination: &Path) -> DownloadResult<u64> {
        let parts = Self::validate(outcomes)?;
        let total = self.merge(&parts, destination).await?;
        info!(
            "合并完成: {} 个分块, {} 字节 -> {}",
            parts.len(),
            total,
            destination.display()
        );
        Self::cleanup(&parts).await;
        Ok(total)
    }

    async fn merge(&self, parts: &[PathBuf], destination: &Path) -> DownloadResult<u64> {
        let output = File::create(destination).await?;
        let mut writer = BufWriter::with_capacity(self.buffer_size, output);
        let mut total = 0u64;

        for part in parts {
            let input = File::open(part).await.map_err(|e| {
                DownloadError::Assembly(format!("无法打开分块文件 {}: {}", part.display(), e))
            })?;
            let mut reader = BufReader::with_capacity(self.buffer_size, input);
            let copied = tokio::io::copy_buf(&mut reader, &mut writer).await?;
            debug!("合并分块 {} ({} 字节)", part.display(), copied);
            total += copied;
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(total)
    }

    /// 删除临时文件，失败只记录日志
    async fn cleanup(parts: &[PathBuf]) {
        for part in parts {
            match tokio::fs::remove_file(part).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("删除临时文件失败 {}: {}", part.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn write_parts(dir: &TempDir, contents: &[&[u8]]) -> Vec<ChunkOutcome> {
        contents
            .iter()
            .enumerate()
            .map(|(i, data)| {
                let path = dir.path().join(format!("chunk{}.bin", i));
                std::fs::write(&path, data).unwrap();
                ChunkOutcome::success(i, path, data.len() as u64)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_assemble_in_index_order() {
        let dir = tempdir().unwrap();
        let outcomes = write_parts(&dir, &[b"hello ", b"chunked ", b"world"]);
        let destination = dir.path().join("out.txt");

        let written = FileAssembler::new(4).assemble(&outcomes, &destination).await.unwrap();

        assert_eq!(written, 19);
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello chunked world");
        for outcome in &outcomes {
            assert!(!outcome.temp_path.as_ref().unwrap().exists());
        }
    }

    #[tokio::test]
    async fn test_any_permutation_gives_identical_output() {
        let chunks: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 100 + i as usize * 13]).collect();
        let expected: Vec<u8> = chunks.concat();
        let mut rng = rand::thread_rng();

        for round in 0..10 {
            let dir = tempdir().unwrap();
            let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
            let mut outcomes = write_parts(&dir, &refs);
            outcomes.shuffle(&mut rng);

            let destination = dir.path().join(format!("out{}.bin", round));
            FileAssembler::default().assemble(&outcomes, &destination).await.unwrap();
            assert_eq!(std::fs::read(&destination).unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_missing_chunk_leaves_destination_untouched() {
        let dir = tempdir().unwrap();
        let mut outcomes = write_parts(&dir, &[b"aaa", b"bbb", b"ccc"]);
        outcomes.remove(1);
        let destination = dir.path().join("out.bin");

        let err = FileAssembler::default().assemble(&outcomes, &destination).await.unwrap_err();
        assert!(matches!(err, DownloadError::Assembly(_)));
        assert!(!destination.exists());

        // 已存在的目标文件不被修改
        std::fs::write(&destination, b"previous").unwrap();
        assert!(FileAssembler::default().assemble(&outcomes, &destination).await.is_err());
        assert_eq!(std::fs::read(&destination).unwrap(), b"previous");
        // 校验失败时临时文件保留
        assert!(outcomes.iter().all(|o| o.temp_path.as_ref().unwrap().exists()));
    }

    #[tokio::test]
    async fn test_failed_chunk_rejected() {
        let dir = tempdir().unwrap();
        let mut outcomes = write_parts(&dir, &[b"aaa", b"bbb"]);
        outcomes[1] = ChunkOutcome {
            chunk_index: 1,
            temp_path: None,
            bytes_downloaded: 1,
            success: false,
            error: Some(Arc::new(DownloadError::Cancelled)),
        };
        let destination = dir.path().join("out.bin");

        let err = FileAssembler::default().assemble(&outcomes, &destination).await.unwrap_err();
        assert!(err.to_string().contains("分块 1"));
        assert!(!destination.exists());
    }

    #[test]
    fn test_validate_rejects_empty_and_duplicates() {
        assert!(FileAssembler::validate(&[]).is_err());

        let a = ChunkOutcome::success(0, PathBuf::from("a"), 1);
        let b = ChunkOutcome::success(0, PathBuf::from("b"), 1);
        assert!(FileAssembler::validate(&[a.clone(), b]).is_err());
        assert_eq!(FileAssembler::validate(&[a]).unwrap(), vec![PathBuf::from("a")]);
    }

    #[tokio::test]
    async fn test_existing_destination_is_truncated() {
        let dir = tempdir().unwrap();
        let destination = dir.path().join("out.bin");
        std::fs::write(&destination, vec![b'x'; 1000]).unwrap();
        let outcomes = write_parts(&dir, &[b"new"]);

        FileAssembler::default().assemble(&outcomes, &destination).await.unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"new");
    }
}
