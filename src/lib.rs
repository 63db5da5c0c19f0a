//! chunkdown: 可断点续传、分块并行的 HTTP 下载引擎
//!
//! 一个 [`Download`] 先用 HEAD 请求获取文件大小，再按配置切成连续分块，
//! 每个分块在共享的线程池上用 `Range` 请求下载到自己的临时文件，全部成功后按顺序合并。
//! 下载可以暂停、恢复、取消，也可以停止后保存为 [`DownloadSnapshot`]，之后从快照继续。
//! 多个下载由 [`DownloadManagerActor`] 统一管理和持久化。

pub mod config;
pub mod core;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::actor_manager::{DownloadInfo, DownloadManagerActor};
pub use crate::core::error::{DownloadError, DownloadResult};
pub use crate::core::task::{Download, DownloadSnapshot, DownloadState, ProgressTracker};
