use log::{debug, error, info, warn};
use reqwest::Client;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use super::assembler::FileAssembler;
use super::chunk::ChunkDownloader;
use super::chunk_manager::ChunkPlan;
use super::outcome::ChunkOutcome;
use super::progress::ProgressTracker;
use super::snapshot::DownloadSnapshot;
use super::state::DownloadState;
use super::util::{build_client, probe_file_info, FileInfo};
use crate::config::Config;
use crate::core::error::{DownloadError, DownloadResult};
use crate::utils::validator;

/// 单个下载任务
///
/// 负责分块计划、分块任务的启动与汇总、状态机以及快照。
/// `start`、`pause`、`resume`、`cancel`、`stop` 都立即返回，
/// 实际工作在线程池上完成；只有 `await_completion` 会等待。
/// 可以廉价克隆，所有克隆共享同一个任务。
#[derive(Clone)]
pub struct Download {
    inner: Arc<DownloadInner>,
}

struct DownloadInner {
    id: String,
    url: String,
    destination: PathBuf,
    temp_dir: PathBuf,
    plan: ChunkPlan,
    config: Config,
    tracker: Arc<ProgressTracker>,
    client: Client,
    pool: Handle,
    from_snapshot: bool,
    shared: Mutex<Shared>,
    /// 状态离开 `Paused` 时唤醒汇总任务
    wake: Notify,
    done: watch::Sender<bool>,
}

struct Shared {
    state: DownloadState,
    /// 按分块序号排列，快照中已完成的分块为 `None`
    workers: Vec<Option<Arc<ChunkDownloader>>>,
    abort_handles: Vec<AbortHandle>,
    error: Option<Arc<DownloadError>>,
    /// 所有分块已结束、正在合并；此时不能暂停或停止
    assembling: bool,
}

/// 分块全部结束后汇总任务的去向
enum Settled {
    Halted,
    Failed,
    Assemble,
}

enum PendingChunk {
    Running {
        index: usize,
        handle: JoinHandle<ChunkOutcome>,
    },
    Ready(ChunkOutcome),
}

impl PendingChunk {
    async fn resolve(self) -> ChunkOutcome {
        match self {
            PendingChunk::Ready(outcome) => outcome,
            PendingChunk::Running { index, handle } => match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => ChunkOutcome::failure(index, DownloadError::Cancelled, 0),
                Err(e) => ChunkOutcome::failure(
                    index,
                    DownloadError::IoError(std::io::Error::other(format!("分块任务异常退出: {}", e))),
                    0,
                ),
            },
        }
    }
}

/// 汇总任务结束（包括被丢弃）时唤醒所有等待者
struct CompletionSignal<'a>(&'a watch::Sender<bool>);

impl Drop for CompletionSignal<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl Download {
    /// 新建下载：发送 HEAD 请求获取文件大小并计算分块计划
    pub async fn new(
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        config: Config,
        tracker: Arc<ProgressTracker>,
        pool: Handle,
    ) -> DownloadResult<Self> {
        let url = url.into();
        let destination = destination.into();
        validator::validate_url(&url)?;
        validator::prepare_destination(&destination)?;
        config.validate()?;

        let id = Uuid::new_v4().to_string();
        let client = build_client(&config)?;
        let info = Self::probe(&pool, &client, &url, &config)
            .await
            .map_err(|source| DownloadError::Probe {
                id: id.clone(),
                url: url.clone(),
                source: Box::new(source),
            })?;

        let plan = ChunkPlan::new(info.size, config.chunk_size, config.min_size_for_chunking)?;
        info!(
            "[{}] 新建下载 {} -> {} ({} 字节, {} 个分块)",
            id,
            url,
            destination.display(),
            info.size,
            plan.len()
        );
        Ok(Self::build(id, url, destination, plan, config, tracker, client, pool, false))
    }

    /// 从快照重建下载，不访问网络，状态为 `Pending`
    pub fn from_snapshot(
        snapshot: DownloadSnapshot,
        config: Config,
        tracker: Arc<ProgressTracker>,
        pool: Handle,
    ) -> DownloadResult<Self> {
        validator::validate_id(&snapshot.id)?;
        validator::validate_url(&snapshot.url)?;
        validator::prepare_destination(&snapshot.destination)?;
        config.validate()?;

        let plan = snapshot.plan(config.chunk_size, config.min_size_for_chunking)?;
        for (&index, &bytes) in &snapshot.chunk_progress {
            tracker.seed(index, bytes);
        }
        let client = build_client(&config)?;
        info!(
            "[{}] 从快照恢复 {} (已下载 {}/{} 字节)",
            snapshot.id,
            snapshot.url,
            plan.already_downloaded(),
            plan.total_size()
        );
        Ok(Self::build(
            snapshot.id,
            snapshot.url,
            snapshot.destination,
            plan,
            config,
            tracker,
            client,
            pool,
            true,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: String,
        url: String,
        destination: PathBuf,
        plan: ChunkPlan,
        config: Config,
        tracker: Arc<ProgressTracker>,
        client: Client,
        pool: Handle,
        from_snapshot: bool,
    ) -> Self {
        let temp_dir = config.temp_directory.join(&id);
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(DownloadInner {
                id,
                url,
                destination,
                temp_dir,
                plan,
                config,
                tracker,
                client,
                pool,
                from_snapshot,
                shared: Mutex::new(Shared {
                    state: DownloadState::Pending,
                    workers: Vec::new(),
                    abort_handles: Vec::new(),
                    error: None,
                    assembling: false,
                }),
                wake: Notify::new(),
                done,
            }),
        }
    }

    async fn probe(pool: &Handle, client: &Client, url: &str, config: &Config) -> DownloadResult<FileInfo> {
        let client = client.clone();
        let target = url.to_string();
        // 在线程池上发请求，连接不会比创建它的运行时活得久
        let info = pool
            .spawn(async move { probe_file_info(&client, &target).await })
            .await
            .map_err(|e| DownloadError::IoError(std::io::Error::other(format!("探测任务异常退出: {}", e))))??;

        if !info.supports_range && info.size >= config.min_size_for_chunking {
            return Err(DownloadError::RangeNotSupported);
        }
        Ok(info)
    }

    /// 开始新下载，立即返回
    pub fn start(&self) -> DownloadResult<()> {
        let mut shared = self.inner.shared();
        if shared.state != DownloadState::Pending || self.inner.from_snapshot {
            return Err(DownloadError::illegal_state("开始新下载", shared.state));
        }
        self.inner.launch(&mut shared)
    }

    /// 按快照记录的进度继续下载，立即返回
    pub fn start_from_snapshot(&self) -> DownloadResult<()> {
        let mut shared = self.inner.shared();
        if shared.state != DownloadState::Pending || !self.inner.from_snapshot {
            return Err(DownloadError::illegal_state("从快照继续下载", shared.state));
        }
        self.inner.launch(&mut shared)
    }

    pub fn pause(&self) -> DownloadResult<()> {
        let mut shared = self.inner.shared();
        if shared.assembling || !shared.state.can_transition_to(DownloadState::Paused) {
            return Err(DownloadError::illegal_state("暂停", shared.state));
        }
        for worker in shared.workers.iter().flatten() {
            worker.pause();
        }
        shared.state = DownloadState::Paused;
        info!("[{}] 已暂停", self.inner.id);
        Ok(())
    }

    /// 恢复暂停的下载；对从快照加载、尚未开始的下载等同于 `start_from_snapshot`
    pub fn resume(&self) -> DownloadResult<()> {
        let mut shared = self.inner.shared();
        let state = shared.state;
        match state {
            DownloadState::Paused => {
                for worker in shared.workers.iter().flatten() {
                    worker.resume();
                }
                shared.state = DownloadState::Downloading;
                drop(shared);
                self.inner.wake.notify_waiters();
                info!("[{}] 已恢复", self.inner.id);
                Ok(())
            }
            DownloadState::Pending if self.inner.from_snapshot => self.inner.launch(&mut shared),
            state => Err(DownloadError::illegal_state("恢复", state)),
        }
    }

    /// 取消下载
    ///
    /// 临时目录由汇总任务在所有分块退出后删除；合并期间取消时，合并结束后连同目标文件一起删除。
    pub fn cancel(&self) -> DownloadResult<()> {
        let mut shared = self.inner.shared();
        let state = shared.state;
        match state {
            DownloadState::Completed | DownloadState::Cancelled => return Ok(()),
            state if !state.can_transition_to(DownloadState::Cancelled) => {
                return Err(DownloadError::illegal_state("取消", state))
            }
            _ => {}
        }
        shared.state = DownloadState::Cancelled;
        for worker in shared.workers.iter().flatten() {
            worker.cancel();
        }
        for handle in &shared.abort_handles {
            handle.abort();
        }
        drop(shared);
        self.inner.wake.notify_waiters();
        info!("[{}] 已取消", self.inner.id);
        Ok(())
    }

    /// 停止下载，保留临时文件和进度以便之后从快照继续
    pub fn stop(&self) -> DownloadResult<()> {
        let mut shared = self.inner.shared();
        let state = shared.state;
        match state {
            DownloadState::Completed | DownloadState::Cancelled | DownloadState::Stopped => return Ok(()),
            state if shared.assembling || !state.can_transition_to(DownloadState::Stopped) => {
                return Err(DownloadError::illegal_state("停止", state))
            }
            _ => {}
        }
        shared.state = DownloadState::Stopped;
        // 不强行中止任务，让每个分块在缓冲区边界停下，计数与文件保持一致
        for worker in shared.workers.iter().flatten() {
            worker.cancel();
        }
        drop(shared);
        self.inner.wake.notify_waiters();
        info!("[{}] 已停止", self.inner.id);
        Ok(())
    }

    /// 等待下载进入终态
    ///
    /// `Failed` 时返回带 id 和 url 的错误；`Completed`、`Cancelled`、`Stopped` 返回 `Ok`。
    pub async fn await_completion(&self) -> DownloadResult<()> {
        let state = self.state();
        if state == DownloadState::Pending {
            return Err(DownloadError::illegal_state("等待完成", state));
        }

        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;

        let shared = self.inner.shared();
        match shared.state {
            DownloadState::Completed | DownloadState::Cancelled | DownloadState::Stopped => Ok(()),
            DownloadState::Failed => Err(DownloadError::Failed {
                id: self.inner.id.clone(),
                url: self.inner.url.clone(),
                source: shared
                    .error
                    .clone()
                    .unwrap_or_else(|| Arc::new(DownloadError::Assembly("未记录失败原因".to_string()))),
            }),
            state => Err(DownloadError::illegal_state("等待完成", state)),
        }
    }

    /// 按当前各分块计数生成快照，任何状态都可以调用
    pub fn create_snapshot(&self) -> DownloadSnapshot {
        let shared = self.inner.shared();
        DownloadSnapshot {
            id: self.inner.id.clone(),
            url: self.inner.url.clone(),
            destination: self.inner.destination.clone(),
            total_size: self.inner.plan.total_size(),
            chunk_size: self.inner.plan.chunk_size(),
            chunk_progress: self.inner.chunk_progress(&shared).collect(),
            state: shared.state,
        }
    }

    /// 删除本任务的临时目录
    pub async fn remove_temp_files(&self) {
        self.inner.remove_temp_dir().await;
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn destination(&self) -> &Path {
        &self.inner.destination
    }

    pub fn file_name(&self) -> Option<&str> {
        self.inner.destination.file_name().and_then(|n| n.to_str())
    }

    pub fn temp_dir(&self) -> &Path {
        &self.inner.temp_dir
    }

    pub fn total_size(&self) -> u64 {
        self.inner.plan.total_size()
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.plan.len()
    }

    pub fn state(&self) -> DownloadState {
        self.inner.shared().state
    }

    /// 进度百分比，来自进度跟踪器
    pub fn progress(&self) -> f64 {
        match self.total_size() {
            0 => 0.0,
            total => self.inner.tracker.percentage(total),
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        let shared = self.inner.shared();
        self.inner.chunk_progress(&shared).map(|(_, bytes)| bytes).sum()
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total_size().saturating_sub(self.downloaded_bytes())
    }

    pub fn error(&self) -> Option<Arc<DownloadError>> {
        self.inner.shared().error.clone()
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("destination", &self.inner.destination)
            .field("total_size", &self.inner.plan.total_size())
            .field("state", &self.state())
            .finish()
    }
}

impl DownloadInner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chunk_path(&self, index: usize) -> PathBuf {
        self.temp_dir.join(format!("chunk{}.bin", index))
    }

    fn chunk_progress<'a>(&'a self, shared: &'a Shared) -> impl Iterator<Item = (usize, u64)> + 'a {
        self.plan.chunks().iter().map(move |spec| {
            let bytes = shared
                .workers
                .get(spec.index)
                .and_then(Option::as_ref)
                .map_or(spec.already_downloaded, |worker| worker.bytes_downloaded());
            (spec.index, bytes)
        })
    }

    /// 为每个未完成的分块启动下载任务，再启动一个汇总任务
    fn launch(self: &Arc<Self>, shared: &mut Shared) -> DownloadResult<()> {
        self.config.ensure_temp_directory()?;
        std::fs::create_dir_all(&self.temp_dir)?;

        // 先构造全部分块，参数错误时不启动任何任务
        let mut workers = Vec::with_capacity(self.plan.len());
        for spec in self.plan.chunks() {
            if spec.is_complete() {
                workers.push(None);
                continue;
            }
            if spec.already_downloaded > 0 {
                debug!("[{}] 分块 {} 从偏移 {} 继续", self.id, spec.index, spec.resume_offset());
            }
            let worker = ChunkDownloader::new(
                self.url.clone(),
                *spec,
                self.chunk_path(spec.index),
                &self.config,
                Some(self.tracker.clone()),
            )?;
            workers.push(Some(Arc::new(worker)));
        }

        let mut pending = Vec::with_capacity(workers.len());
        let mut abort_handles = Vec::new();
        for (spec, worker) in self.plan.chunks().iter().zip(&workers) {
            match worker {
                Some(worker) => {
                    let worker = worker.clone();
                    let client = self.client.clone();
                    let handle = self.pool.spawn(async move { worker.run(&client).await });
                    abort_handles.push(handle.abort_handle());
                    pending.push(PendingChunk::Running {
                        index: spec.index,
                        handle,
                    });
                }
                None => {
                    debug!("[{}] 分块 {} 已完成, 跳过", self.id, spec.index);
                    pending.push(PendingChunk::Ready(ChunkOutcome::success(
                        spec.index,
                        self.chunk_path(spec.index),
                        spec.len(),
                    )));
                }
            }
        }

        if !shared.state.can_transition_to(DownloadState::Downloading) {
            return Err(DownloadError::illegal_state("开始下载", shared.state));
        }
        shared.state = DownloadState::Downloading;
        shared.workers = workers;
        shared.abort_handles = abort_handles;

        let aggregator = self.clone();
        self.pool.spawn(async move { aggregator.aggregate(pending).await });
        info!("[{}] 开始下载, {} 个分块", self.id, self.plan.len());
        Ok(())
    }

    fn is_halted(&self) -> bool {
        matches!(
            self.shared().state,
            DownloadState::Cancelled | DownloadState::Stopped
        )
    }

    fn cancel_workers(&self) {
        for worker in self.shared().workers.iter().flatten() {
            worker.cancel();
        }
    }

    /// 按计划顺序收集分块结果并决定最终状态
    async fn aggregate(self: Arc<Self>, pending: Vec<PendingChunk>) {
        let _signal = CompletionSignal(&self.done);

        let mut outcomes = Vec::with_capacity(pending.len());
        let mut failure = None;
        let mut pending = pending.into_iter();
        for chunk in pending.by_ref() {
            let outcome = chunk.resolve().await;
            if self.is_halted() {
                break;
            }
            if !outcome.success {
                let index = outcome.chunk_index;
                let source = outcome
                    .cause()
                    .unwrap_or_else(|| Arc::new(DownloadError::Cancelled));
                failure = Some(Arc::new(DownloadError::ChunkFailed { index, source }));
                self.cancel_workers();
                break;
            }
            outcomes.push(outcome);
        }
        // 等所有分块任务退出后再做决定，之后不会再有写入
        for chunk in pending {
            chunk.resolve().await;
        }

        match self.settle(failure).await {
            Settled::Halted => {
                let state = self.shared().state;
                if state == DownloadState::Cancelled {
                    self.remove_temp_dir().await;
                }
                debug!("[{}] 汇总任务退出: {}", self.id, state);
                return;
            }
            Settled::Failed => return,
            Settled::Assemble => {}
        }

        let assembler = FileAssembler::new(self.config.buffer_size);
        let result = assembler.assemble(&outcomes, &self.destination).await;
        let cancelled = self.finish_assembly(result);
        if cancelled {
            debug!("[{}] 合并期间已取消, 删除目标文件", self.id);
            self.remove_destination().await;
        }
        let state = self.shared().state;
        // 合并失败时保留分块文件
        if cancelled || state == DownloadState::Completed {
            self.remove_temp_dir().await;
        }
    }

    /// 分块全部结束后决定去向，暂停中则等到恢复、停止或取消
    async fn settle(&self, failure: Option<Arc<DownloadError>>) -> Settled {
        loop {
            let woken = self.wake.notified();
            {
                let mut shared = self.shared();
                let state = shared.state;
                match state {
                    DownloadState::Paused => {}
                    DownloadState::Downloading => {
                        return match failure {
                            Some(error) => {
                                self.fail(&mut shared, error);
                                Settled::Failed
                            }
                            None => {
                                shared.assembling = true;
                                Settled::Assemble
                            }
                        };
                    }
                    _ => return Settled::Halted,
                }
            }
            debug!("[{}] 分块已全部结束, 等待恢复", self.id);
            woken.await;
        }
    }

    /// 在锁内结束合并阶段，返回合并期间是否已被取消
    fn finish_assembly(&self, result: DownloadResult<u64>) -> bool {
        let mut shared = self.shared();
        shared.assembling = false;
        if shared.state == DownloadState::Cancelled {
            return true;
        }
        match result {
            Ok(_) => {
                if self.transition(&mut shared, DownloadState::Completed) {
                    info!("[{}] 下载完成: {}", self.id, self.destination.display());
                }
            }
            Err(e) => self.fail(&mut shared, Arc::new(e)),
        }
        false
    }

    fn fail(&self, shared: &mut Shared, error: Arc<DownloadError>) {
        if self.transition(shared, DownloadState::Failed) {
            error!("[{}] 下载失败 {}: {}", self.id, self.url, error);
            shared.error = Some(error);
        }
    }

    fn transition(&self, shared: &mut Shared, next: DownloadState) -> bool {
        if !shared.state.can_transition_to(next) {
            debug!("[{}] 忽略状态变化 {} -> {}", self.id, shared.state, next);
            return false;
        }
        shared.state = next;
        true
    }

    async fn remove_destination(&self) {
        match tokio::fs::remove_file(&self.destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("[{}] 删除目标文件失败 {}: {}", self.id, self.destination.display(), e),
        }
    }

    async fn remove_temp_dir(&self) {
        match tokio::fs::remove_dir_all(&self.temp_dir).await {
            Ok(()) => debug!("[{}] 已删除临时目录 {}", self.id, self.temp_dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("[{}] 删除临时目录失败 {}: {}", self.id, self.temp_dir.display(), e),
        }
    }
}
