use actix::prelude::*;
use anyhow::Context as _;
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};

use crate::config::Config;
use crate::core::error::{DownloadError, DownloadResult};
use crate::core::task::{Download, DownloadSnapshot, DownloadState, ProgressTracker};

/// ================== 任务信息结构体 ==================
#[derive(Serialize, Clone, Debug)]
pub struct DownloadInfo {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    pub state: DownloadState,
    pub progress: f64,
    pub total_size: u64,
    pub downloaded: u64,
    pub error: Option<String>,
}

impl From<&Download> for DownloadInfo {
    fn from(download: &Download) -> Self {
        Self {
            id: download.id().to_string(),
            url: download.url().to_string(),
            destination: download.destination().to_path_buf(),
            state: download.state(),
            progress: download.progress(),
            total_size: download.total_size(),
            downloaded: download.downloaded_bytes(),
            error: download.error().map(|e| e.to_string()),
        }
    }
}

/// 添加并立即开始下载，返回任务 id
pub struct StartDownload {
    pub url: String,
    pub destination: PathBuf,
}
impl Message for StartDownload { type Result = Result<String, DownloadError>; }
impl Handler<StartDownload> for DownloadManagerActor {
    type Result = ResponseActFuture<Self, Result<String, DownloadError>>;
    fn handle(&mut self, msg: StartDownload, _ctx: &mut Self::Context) -> Self::Result {
        let pool = match self.check_destination(&msg.destination).and_then(|_| self.pool()) {
            Ok(pool) => pool,
            Err(e) => return Box::pin(fut::ready(Err(e))),
        };
        let create = Download::new(
            msg.url,
            msg.destination,
            self.config.clone(),
            Arc::new(ProgressTracker::new()),
            pool,
        );
        Box::pin(create.into_actor(self).map(|result: DownloadResult<Download>, act: &mut Self, _ctx| -> Result<String, DownloadError> {
            let download = result?;
            // 探测期间可能有同一路径的任务加入
            act.check_destination(download.destination())?;
            download.start()?;
            let id = download.id().to_string();
            act.downloads.insert(id.clone(), download);
            act.persist();
            Ok(id)
        }))
    }
}

/// 暂停指定任务
pub struct PauseDownload { pub id: String }
impl Message for PauseDownload { type Result = Result<(), DownloadError>; }
impl Handler<PauseDownload> for DownloadManagerActor {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: PauseDownload, _ctx: &mut Self::Context) -> Self::Result {
        self.get(&msg.id)?.pause()
    }
}

/// 恢复指定任务：暂停中的继续下载，从文件加载的按快照开始
pub struct ResumeDownload { pub id: String }
impl Message for ResumeDownload { type Result = Result<(), DownloadError>; }
impl Handler<ResumeDownload> for DownloadManagerActor {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: ResumeDownload, _ctx: &mut Self::Context) -> Self::Result {
        self.get(&msg.id)?.resume()?;
        self.persist();
        Ok(())
    }
}

/// 取消指定任务并从管理器中移除
pub struct CancelDownload { pub id: String }
impl Message for CancelDownload { type Result = Result<(), DownloadError>; }
impl Handler<CancelDownload> for DownloadManagerActor {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: CancelDownload, _ctx: &mut Self::Context) -> Self::Result {
        let download = self.get(&msg.id)?.clone();
        if download.cancel().is_err() {
            // 未开始、已失败或已停止的任务没有可取消的分块，只清理临时文件
            if let Ok(pool) = self.pool() {
                let leftover = download.clone();
                pool.spawn(async move { leftover.remove_temp_files().await });
            }
        }
        self.downloads.remove(&msg.id);
        self.persist();
        info!("已移除下载任务 {}", msg.id);
        Ok(())
    }
}

/// 停止指定任务，保留进度以便之后恢复
pub struct StopDownload { pub id: String }
impl Message for StopDownload { type Result = Result<(), DownloadError>; }
impl Handler<StopDownload> for DownloadManagerActor {
    type Result = Result<(), DownloadError>;
    fn handle(&mut self, msg: StopDownload, _ctx: &mut Self::Context) -> Self::Result {
        self.get(&msg.id)?.stop()?;
        self.persist();
        Ok(())
    }
}

/// 获取任务句柄
pub struct GetDownload { pub id: String }
impl Message for GetDownload { type Result = Option<Download>; }
impl Handler<GetDownload> for DownloadManagerActor {
    type Result = Option<Download>;
    fn handle(&mut self, msg: GetDownload, _ctx: &mut Self::Context) -> Self::Result {
        self.downloads.get(&msg.id).cloned()
    }
}

/// 列出所有任务
pub struct ListDownloads;
impl Message for ListDownloads { type Result = Vec<DownloadInfo>; }
impl Handler<ListDownloads> for DownloadManagerActor {
    type Result = MessageResult<ListDownloads>;
    fn handle(&mut self, _msg: ListDownloads, _ctx: &mut Self::Context) -> Self::Result {
        let mut list: Vec<DownloadInfo> = self.downloads.values().map(DownloadInfo::from).collect();
        list.sort_by(|a, b| a.destination.cmp(&b.destination));
        MessageResult(list)
    }
}

/// 关闭管理器：停止所有进行中的任务，保存快照，关闭线程池。返回保存的任务数
pub struct Shutdown;
impl Message for Shutdown { type Result = Result<usize, DownloadError>; }
impl Handler<Shutdown> for DownloadManagerActor {
    type Result = ResponseActFuture<Self, Result<usize, DownloadError>>;
    fn handle(&mut self, _msg: Shutdown, _ctx: &mut Self::Context) -> Self::Result {
        let live: Vec<Download> = self
            .downloads
            .values()
            .filter(|d| d.state().is_active())
            .cloned()
            .collect();
        for download in &live {
            if let Err(e) = download.stop() {
                warn!("停止任务 {} 失败: {}", download.id(), e);
            }
        }
        // 等每个分块在缓冲区边界停下，快照才和临时文件一致
        let settled = futures::future::join_all(live.into_iter().map(|download| async move {
            let _ = download.await_completion().await;
        }));

        Box::pin(settled.into_actor(self).map(|_, act: &mut Self, _ctx| -> Result<usize, DownloadError> {
            let saved = act
                .save_downloads()
                .map_err(|e| DownloadError::Persistence(format!("{:#}", e)))?;
            act.downloads.clear();
            if let Some(runtime) = act.runtime.take() {
                runtime.shutdown_background();
            }
            info!("下载管理器已关闭, 保存了 {} 个未完成任务", saved);
            Ok(saved)
        }))
    }
}

impl Actor for DownloadManagerActor {
    type Context = Context<Self>;
}

/// 全局任务管理器 Actor
///
/// 持有下载线程池，负责任务的创建、查找和持久化。
pub struct DownloadManagerActor {
    config: Config,
    runtime: Option<Runtime>,
    downloads: HashMap<String, Download>,
}

impl DownloadManagerActor {
    /// 创建任务管理器，并从状态文件恢复未完成的任务
    pub fn new(config: Config) -> DownloadResult<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.number_of_threads)
            .thread_name("chunkdown-worker")
            .enable_all()
            .build()?;

        let mut manager = Self {
            config,
            runtime: Some(runtime),
            downloads: HashMap::new(),
        };
        match manager.load_downloads() {
            Ok(0) => {}
            Ok(count) => info!("从 {} 恢复了 {} 个任务", manager.config.state_file.display(), count),
            Err(e) => warn!("加载任务列表失败: {:#}", e),
        }
        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn pool(&self) -> DownloadResult<Handle> {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.handle().clone())
            .ok_or(DownloadError::ShutDown)
    }

    fn get(&self, id: &str) -> DownloadResult<&Download> {
        self.downloads
            .get(id)
            .ok_or_else(|| DownloadError::InvalidArgument(format!("任务ID不存在: {}", id)))
    }

    /// 同一个目标路径只能有一个未结束的任务
    fn check_destination(&self, destination: &Path) -> DownloadResult<()> {
        let taken = self
            .downloads
            .values()
            .any(|d| d.destination() == destination && !matches!(d.state(), DownloadState::Completed | DownloadState::Cancelled | DownloadState::Failed));
        if taken {
            return Err(DownloadError::InvalidArgument(format!(
                "目标文件已被其他任务使用: {}",
                destination.display()
            )));
        }
        Ok(())
    }

    fn is_resumable(state: DownloadState) -> bool {
        matches!(
            state,
            DownloadState::Pending | DownloadState::Downloading | DownloadState::Paused | DownloadState::Stopped
        )
    }

    fn persist(&self) {
        if let Err(e) = self.save_downloads() {
            warn!("保存任务列表失败: {:#}", e);
        }
    }

    /// 把可恢复任务的快照写入状态文件，返回写入的数量
    pub fn save_downloads(&self) -> anyhow::Result<usize> {
        let mut snapshots: Vec<DownloadSnapshot> = self
            .downloads
            .values()
            .map(Download::create_snapshot)
            .filter(|s| Self::is_resumable(s.state))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));

        let path = &self.config.state_file;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("无法创建目录 {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&snapshots).context("序列化任务列表失败")?;
        fs::write(path, json).with_context(|| format!("无法写入 {}", path.display()))?;
        Ok(snapshots.len())
    }

    /// 从状态文件重建任务，单个任务失败只记录日志
    pub fn load_downloads(&mut self) -> anyhow::Result<usize> {
        let path = self.config.state_file.clone();
        if !path.exists() {
            return Ok(0);
        }
        let data = fs::read_to_string(&path).with_context(|| format!("无法读取 {}", path.display()))?;
        let snapshots: Vec<DownloadSnapshot> =
            serde_json::from_str(&data).with_context(|| format!("任务列表格式错误 {}", path.display()))?;

        let pool = self.pool()?;
        let mut restored = 0;
        for snapshot in snapshots {
            let id = snapshot.id.clone();
            match Download::from_snapshot(snapshot, self.config.clone(), Arc::new(ProgressTracker::new()), pool.clone()) {
                Ok(download) => {
                    self.downloads.insert(id, download);
                    restored += 1;
                }
                Err(e) => warn!("无法恢复任务 {}: {}", id, e),
            }
        }
        Ok(restored)
    }
}

impl Drop for DownloadManagerActor {
    fn drop(&mut self) {
        // 运行时不能在异步上下文里以阻塞方式销毁
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
