use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::error::{DownloadError, DownloadResult};

/// 下载块结构
///
/// `start` 和 `end` 都是闭区间端点。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub already_downloaded: u64,
}

impl ChunkSpec {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// 断点续传时真正需要请求的起始字节
    pub fn resume_offset(&self) -> u64 {
        self.start + self.already_downloaded
    }

    pub fn is_complete(&self) -> bool {
        self.already_downloaded >= self.len()
    }
}

/// 分块计划
///
/// 各分块首尾相接、互不重叠，恰好覆盖 `[0, total_size)`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunks: Vec<ChunkSpec>,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64, min_size_for_chunking: u64) -> DownloadResult<Self> {
        if total_size == 0 {
            return Err(DownloadError::InvalidArgument("文件大小必须大于0".to_string()));
        }
        if chunk_size == 0 {
            return Err(DownloadError::InvalidArgument("分块大小必须大于0".to_string()));
        }

        // 小文件不分块
        if total_size < min_size_for_chunking {
            return Ok(Self {
                total_size,
                chunks: vec![ChunkSpec {
                    index: 0,
                    start: 0,
                    end: total_size - 1,
                    already_downloaded: 0,
                }],
            });
        }

        let num_chunks = total_size.div_ceil(chunk_size) as usize;
        let chunks = (0..num_chunks)
            .map(|i| {
                let start = i as u64 * chunk_size;
                let end = (start + chunk_size).min(total_size) - 1;
                ChunkSpec {
                    index: i,
                    start,
                    end,
                    already_downloaded: 0,
                }
            })
            .collect();

        Ok(Self { total_size, chunks })
    }

    /// 用快照中记录的分块进度填充计划
    pub fn with_progress(mut self, progress: &BTreeMap<usize, u64>) -> DownloadResult<Self> {
        let count = self.chunks.len();
        for (&index, &downloaded) in progress {
            let chunk = self.chunks.get_mut(index).ok_or_else(|| {
                DownloadError::Snapshot(format!("分块序号 {} 超出计划范围 (共 {} 块)", index, count))
            })?;
            if downloaded > chunk.len() {
                return Err(DownloadError::Snapshot(format!(
                    "分块 {} 已下载 {} 字节, 超过分块长度 {}",
                    index,
                    downloaded,
                    chunk.len()
                )));
            }
            chunk.already_downloaded = downloaded;
        }
        Ok(self)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 第一个分块的长度，用它可以重建同样的计划
    pub fn chunk_size(&self) -> u64 {
        self.chunks.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn chunks(&self) -> &[ChunkSpec] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn already_downloaded(&self) -> u64 {
        self.chunks.iter().map(|c| c.already_downloaded).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_contiguous(plan: &ChunkPlan, total_size: u64) {
        let mut next = 0;
        for (i, chunk) in plan.chunks().iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.start, next, "分块 {} 不连续", i);
            assert!(chunk.end >= chunk.start);
            next = chunk.end + 1;
        }
        assert_eq!(next, total_size);
        let sum: u64 = plan.chunks().iter().map(|c| c.len()).sum();
        assert_eq!(sum, total_size);
    }

    #[test]
    fn test_plan_three_chunks() {
        let plan = ChunkPlan::new(10_000, 4096, 0).unwrap();
        let ranges: Vec<_> = plan.chunks().iter().map(|c| (c.index, c.start, c.end)).collect();
        assert_eq!(ranges, vec![(0, 0, 4095), (1, 4096, 8191), (2, 8192, 9999)]);
    }

    #[test]
    fn test_small_file_single_chunk() {
        let plan = ChunkPlan::new(500, 4096, 1024).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks()[0], ChunkSpec { index: 0, start: 0, end: 499, already_downloaded: 0 });
        assert_eq!(ChunkPlan::new(500, plan.chunk_size(), 0).unwrap(), plan);
    }

    #[test]
    fn test_plan_is_contiguous() {
        for total_size in [1, 2, 1023, 1024, 1025, 4096, 4097, 10_000, 65_537, 5 * 1024 * 1024 + 3] {
            for chunk_size in [1024, 1500, 4096, 5 * 1024 * 1024] {
                let plan = ChunkPlan::new(total_size, chunk_size, 0).unwrap();
                assert_contiguous(&plan, total_size);
                assert_eq!(plan.len() as u64, total_size.div_ceil(chunk_size));
            }
        }
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let plan = ChunkPlan::new(8192, 4096, 0).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.chunks()[1].len(), 4096);
    }

    #[test]
    fn test_invalid_plan() {
        assert!(ChunkPlan::new(0, 4096, 0).is_err());
        assert!(ChunkPlan::new(100, 0, 0).is_err());
    }

    #[test]
    fn test_with_progress() {
        let progress = BTreeMap::from([(0, 4096), (2, 100)]);
        let plan = ChunkPlan::new(10_000, 4096, 0).unwrap().with_progress(&progress).unwrap();

        assert!(plan.chunks()[0].is_complete());
        assert_eq!(plan.chunks()[1].already_downloaded, 0);
        assert_eq!(plan.chunks()[2].resume_offset(), 8292);
        assert_eq!(plan.already_downloaded(), 4196);

        let too_much = BTreeMap::from([(2, 1809)]);
        assert!(matches!(
            ChunkPlan::new(10_000, 4096, 0).unwrap().with_progress(&too_much),
            Err(DownloadError::Snapshot(_))
        ));

        let out_of_range = BTreeMap::from([(3, 1)]);
        assert!(ChunkPlan::new(10_000, 4096, 0).unwrap().with_progress(&out_of_range).is_err());
    }
}
