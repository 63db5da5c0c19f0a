use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::core::task::state::DownloadState;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("网络错误: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("IO错误: {0}")]
    IoError(#[from] io::Error),

    #[error("无效的参数: {0}")]
    InvalidArgument(String),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("非法状态: 无法{op}, 当前状态: {state}")]
    IllegalState {
        op: &'static str,
        state: DownloadState,
    },

    #[error("获取文件元数据失败 [id={id}] [url={url}]: {source}")]
    Probe {
        id: String,
        url: String,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("服务器响应状态异常: 预期 {expected}, 实际 {status}")]
    UnexpectedStatus {
        status: u16,
        expected: u16,
    },

    #[error("无效的 Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("服务器不支持范围请求, 无法分块下载")]
    RangeNotSupported,

    #[error("下载被取消")]
    Cancelled,

    #[error("合并分块失败: {0}")]
    Assembly(String),

    #[error("分块 {index} 下载失败: {source}")]
    ChunkFailed {
        index: usize,
        #[source]
        source: Arc<DownloadError>,
    },

    #[error("下载失败 [id={id}] [url={url}]: {source}")]
    Failed {
        id: String,
        url: String,
        #[source]
        source: Arc<DownloadError>,
    },

    #[error("快照无效: {0}")]
    Snapshot(String),

    #[error("配置无效: {0}")]
    Config(String),

    #[error("持久化失败: {0}")]
    Persistence(String),

    #[error("下载管理器已关闭")]
    ShutDown,
}

impl DownloadError {
    /// 单次传输尝试失败后是否值得重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::NetworkError(_)
                | DownloadError::IoError(_)
                | DownloadError::UnexpectedStatus { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }

    /// 沿着 source 链查找最底层的 HTTP 状态码
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DownloadError::UnexpectedStatus { status, .. } => Some(*status),
            DownloadError::NetworkError(e) => e.status().map(|s| s.as_u16()),
            DownloadError::Probe { source, .. } => source.status_code(),
            DownloadError::ChunkFailed { source, .. } | DownloadError::Failed { source, .. } => {
                source.status_code()
            }
            _ => None,
        }
    }

    pub(crate) fn illegal_state(op: &'static str, state: DownloadState) -> Self {
        DownloadError::IllegalState { op, state }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
