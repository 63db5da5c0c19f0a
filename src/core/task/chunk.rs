use futures::TryStreamExt;
use log::{debug, info, warn};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::io::StreamReader;

use super::chunk_manager::ChunkSpec;
use super::outcome::ChunkOutcome;
use super::progress::ProgressTracker;
use super::retry::{RetryContext, RetryStrategy};
use crate::config::Config;
use crate::core::error::{DownloadError, DownloadResult};

/// 分块任务的暂停/取消标志
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkControl {
    pub paused: bool,
    pub cancelled: bool,
}

/// 分块下载器
///
/// 负责一个闭区间字节范围的下载，写入独立的临时文件。暂停和取消是协作式的：
/// 每次读取响应体之前检查标志，取消会立即打断正在等待的连接、读取和重试间隔。
#[derive(Debug)]
pub struct ChunkDownloader {
    url: String,
    index: usize,
    start: u64,
    end: u64,
    temp_path: PathBuf,
    initial_bytes: u64,
    downloaded: AtomicU64,
    buffer_size: usize,
    retry: RetryStrategy,
    control: watch::Sender<ChunkControl>,
    tracker: Option<Arc<ProgressTracker>>,
}

impl ChunkDownloader {
    pub fn new(
        url: impl Into<String>,
        spec: ChunkSpec,
        temp_path: impl Into<PathBuf>,
        config: &Config,
        tracker: Option<Arc<ProgressTracker>>,
    ) -> DownloadResult<Self> {
        let url = url.into();
        let temp_path = temp_path.into();

        if url.trim().is_empty() {
            return Err(DownloadError::InvalidArgument("URL不能为空".to_string()));
        }
        if spec.end < spec.start {
            return Err(DownloadError::InvalidArgument(format!(
                "分块 {} 的范围无效: {}-{}",
                spec.index, spec.start, spec.end
            )));
        }
        if spec.already_downloaded > spec.len() || spec.start + spec.already_downloaded > spec.end {
            return Err(DownloadError::InvalidArgument(format!(
                "分块 {} 的已下载字节数无效: {} (范围 {}-{})",
                spec.index, spec.already_downloaded, spec.start, spec.end
            )));
        }
        if config.buffer_size == 0 {
            return Err(DownloadError::InvalidArgument("缓冲区大小必须大于0".to_string()));
        }
        match temp_path.parent() {
            Some(parent) if parent.is_dir() => {}
            _ => {
                return Err(DownloadError::InvalidArgument(format!(
                    "临时文件所在目录不存在: {}",
                    temp_path.display()
                )))
            }
        }

        let (control, _) = watch::channel(ChunkControl::default());
        Ok(Self {
            url,
            index: spec.index,
            start: spec.start,
            end: spec.end,
            temp_path,
            initial_bytes: spec.already_downloaded,
            downloaded: AtomicU64::new(spec.already_downloaded),
            buffer_size: config.buffer_size,
            retry: RetryStrategy::from_config(config),
            control,
            tracker,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn range_len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// 已写入临时文件的字节数，包含恢复时的初始值
    pub fn bytes_downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.control.send_modify(|c| c.paused = true);
    }

    pub fn resume(&self) {
        self.control.send_modify(|c| c.paused = false);
    }

    /// 取消会唤醒处于暂停中的任务
    pub fn cancel(&self) {
        self.control.send_modify(|c| c.cancelled = true);
    }

    pub fn is_paused(&self) -> bool {
        self.control.borrow().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.borrow().cancelled
    }

    /// 运行分块下载，恰好产出一个结果
    pub async fn run(&self, client: &Client) -> ChunkOutcome {
        if let Err(e) = self.prepare_artifact().await {
            warn!("[chunk {}] 准备临时文件失败: {}", self.index, e);
            return ChunkOutcome::failure(self.index, e, self.bytes_downloaded());
        }

        let mut retry = RetryContext::new(self.retry.clone());
        loop {
            match self.download_once(client).await {
                Ok(()) => {
                    debug!(
                        "[chunk {}] 下载完成, 共 {} 字节",
                        self.index,
                        self.bytes_downloaded()
                    );
                    return ChunkOutcome::success(self.index, self.temp_path.clone(), self.bytes_downloaded());
                }
                Err(DownloadError::Cancelled) => {
                    info!("[chunk {}] 已取消", self.index);
                    return ChunkOutcome::failure(self.index, DownloadError::Cancelled, self.bytes_downloaded());
                }
                Err(e) => {
                    warn!(
                        "[chunk {}] 第 {} 次尝试失败: {}",
                        self.index,
                        retry.attempts + 1,
                        e
                    );
                    retry.record_failure(e);
                    if !retry.should_retry() {
                        break;
                    }
                    if self.sleep_unless_cancelled(retry.delay()).await {
                        return ChunkOutcome::failure(self.index, DownloadError::Cancelled, self.bytes_downloaded());
                    }
                }
            }
        }

        let cause = retry
            .take_last_error()
            .unwrap_or_else(|| DownloadError::InvalidArgument("没有进行任何尝试".to_string()));
        warn!(
            "[chunk {}] 重试 {} 次后放弃: {}",
            self.index, retry.attempts, cause
        );
        ChunkOutcome::failure(self.index, cause, self.bytes_downloaded())
    }

    /// 临时文件比记录的进度长时截断，保证追加写不会重复
    async fn prepare_artifact(&self) -> DownloadResult<()> {
        let existing = match tokio::fs::metadata(&self.temp_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if existing < self.initial_bytes {
            return Err(DownloadError::Snapshot(format!(
                "分块 {} 的临时文件只有 {} 字节, 少于记录的 {} 字节",
                self.index, existing, self.initial_bytes
            )));
        }
        if existing > self.initial_bytes {
            debug!(
                "[chunk {}] 临时文件 {} 字节, 截断到记录的 {} 字节",
                self.index, existing, self.initial_bytes
            );
            let file = OpenOptions::new().write(true).open(&self.temp_path).await?;
            file.set_len(self.initial_bytes).await?;
        }
        Ok(())
    }

    async fn download_once(&self, client: &Client) -> DownloadResult<()> {
        self.wait_if_paused().await?;

        let from = self.start + self.bytes_downloaded();
        if from > self.end {
            return Ok(());
        }

        let mut control = self.control.subscribe();
        let response = tokio::select! {
            biased;
            _ = Self::cancelled(&mut control) => return Err(DownloadError::Cancelled),
            response = client
                .get(&self.url)
                .header(RANGE, format!("bytes={}-{}", from, self.end))
                .send() => response?,
        };

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::UnexpectedStatus {
                status: status.as_u16(),
                expected: StatusCode::PARTIAL_CONTENT.as_u16(),
            });
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.temp_path)
            .await?;
        let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let mut reader = StreamReader::new(stream);

        let result = self.copy_body(&mut reader, &mut file, &mut control).await;
        // 无论成功与否都要刷盘，下一次尝试会以追加方式重新打开
        let flushed = file.flush().await;
        result?;
        flushed?;

        let downloaded = self.bytes_downloaded();
        if downloaded < self.range_len() {
            return Err(DownloadError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("连接提前关闭: 已收到 {}/{} 字节", downloaded, self.range_len()),
            )));
        }
        Ok(())
    }

    async fn copy_body<R>(
        &self,
        reader: &mut R,
        file: &mut tokio::fs::File,
        control: &mut watch::Receiver<ChunkControl>,
    ) -> DownloadResult<()>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            self.wait_if_paused().await?;

            let n = tokio::select! {
                biased;
                _ = Self::cancelled(control) => return Err(DownloadError::Cancelled),
                n = reader.read(&mut buffer) => n?,
            };
            if n == 0 {
                return Ok(());
            }

            // 服务器多给的数据不属于本分块
            let remaining = self.range_len().saturating_sub(self.bytes_downloaded());
            let n = (n as u64).min(remaining) as usize;
            if n == 0 {
                return Ok(());
            }

            file.write_all(&buffer[..n]).await?;
            self.downloaded.fetch_add(n as u64, Ordering::AcqRel);
            if let Some(tracker) = &self.tracker {
                tracker.record_progress(self.index, n as u64);
            }
        }
    }

    /// 暂停时阻塞，直到恢复或取消
    async fn wait_if_paused(&self) -> DownloadResult<()> {
        let mut control = self.control.subscribe();
        let cancelled = match control.wait_for(|c| c.cancelled || !c.paused).await {
            Ok(state) => state.cancelled,
            Err(_) => true,
        };
        if cancelled {
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }

    async fn cancelled(control: &mut watch::Receiver<ChunkControl>) {
        let _ = control.wait_for(|c| c.cancelled).await;
    }

    /// 重试前等待，期间被取消则返回 true
    async fn sleep_unless_cancelled(&self, delay: Duration) -> bool {
        let mut control = self.control.subscribe();
        tokio::select! {
            biased;
            _ = Self::cancelled(&mut control) => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}
