//! `task` 模块包含了与单个下载任务相关的所有逻辑
//!
//! 主要包括：
//! - `download`: 下载协调器 `Download`，负责状态机和分块调度
//! - `chunk`: 单个分块的范围请求下载器
//! - `chunk_manager`: 分块计划
//! - `assembler`: 分块合并
//! - `progress`: 各分块的进度计数
//! - `snapshot`: 可持久化的下载快照
//! - `state`: 任务状态 `DownloadState`
//! - `retry`: 重试逻辑
//! - `util`: HTTP 客户端与 HEAD 探测

pub mod assembler;
pub mod chunk;
pub mod chunk_manager;
pub mod download;
pub mod outcome;
pub mod progress;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod util;

// 导出核心组件，方便外部使用
pub use self::assembler::FileAssembler;
pub use self::chunk::ChunkDownloader;
pub use self::chunk_manager::{ChunkPlan, ChunkSpec};
pub use self::download::Download;
pub use self::outcome::ChunkOutcome;
pub use self::progress::ProgressTracker;
pub use self::retry::{RetryContext, RetryStrategy};
pub use self::snapshot::DownloadSnapshot;
pub use self::state::DownloadState;
pub use self::util::FileInfo;
