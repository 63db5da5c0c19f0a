use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// 进度跟踪器
///
/// 按分块序号累加已下载字节数，可被多个下载任务和分块并发写入。
#[derive(Debug, Default)]
pub struct ProgressTracker {
    chunks: DashMap<usize, AtomicU64>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录分块新写入的字节数，`bytes` 为 0 时不做任何事
    pub fn record_progress(&self, chunk_index: usize, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if let Some(counter) = self.chunks.get(&chunk_index) {
            counter.fetch_add(bytes, Ordering::Relaxed);
            return;
        }
        self.chunks
            .entry(chunk_index)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// 从快照恢复时写入分块的初始字节数
    pub fn seed(&self, chunk_index: usize, bytes: u64) {
        self.chunks
            .entry(chunk_index)
            .or_insert_with(|| AtomicU64::new(0))
            .store(bytes, Ordering::Relaxed);
    }

    pub fn chunk_bytes(&self, chunk_index: usize) -> u64 {
        self.chunks
            .get(&chunk_index)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// 相对 `total_size` 的百分比，不做上限截断
    ///
    /// `total_size` 为 0 时：没有任何记录返回 0.0，否则返回正无穷。
    pub fn percentage(&self, total_size: u64) -> f64 {
        let downloaded = self.total_bytes();
        if total_size == 0 {
            return if downloaded == 0 { 0.0 } else { f64::INFINITY };
        }
        downloaded as f64 * 100.0 / total_size as f64
    }

    /// 记录过进度的分块数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn reset(&self) {
        self.chunks.clear();
    }
}
