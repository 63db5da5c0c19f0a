//! Core: 下载任务的协调、分块下载、错误处理以及任务管理器

pub mod actor_manager;
pub mod error;
pub mod task;

pub use actor_manager::{
    CancelDownload, DownloadInfo, DownloadManagerActor, GetDownload, ListDownloads, PauseDownload,
    ResumeDownload, Shutdown, StartDownload, StopDownload,
};
pub use error::{DownloadError, DownloadResult};
