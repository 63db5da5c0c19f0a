use std::path::Path;
use url::Url;

use crate::core::error::{DownloadError, DownloadResult};

pub fn is_valid_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

pub fn validate_url(url: &str) -> DownloadResult<()> {
    if url.trim().is_empty() {
        return Err(DownloadError::InvalidArgument("URL不能为空".to_string()));
    }
    if !is_valid_url(url) {
        return Err(DownloadError::InvalidUrl(url.to_string()));
    }
    Ok(())
}

pub fn validate_id(id: &str) -> DownloadResult<()> {
    if id.trim().is_empty() {
        return Err(DownloadError::InvalidArgument("下载任务 id 不能为空".to_string()));
    }
    Ok(())
}

/// 目标路径不能为空，也不能是已存在的目录
pub fn validate_destination(path: &Path) -> DownloadResult<()> {
    if path.as_os_str().is_empty() {
        return Err(DownloadError::InvalidArgument("输出路径不能为空".to_string()));
    }
    if path.is_dir() {
        return Err(DownloadError::InvalidArgument(format!(
            "输出路径是一个目录: {}",
            path.display()
        )));
    }
    if path.file_name().is_none() {
        return Err(DownloadError::InvalidArgument(format!(
            "输出路径缺少文件名: {}",
            path.display()
        )));
    }
    Ok(())
}

/// 校验目标路径并创建其父目录
pub fn prepare_destination(path: &Path) -> DownloadResult<()> {
    validate_destination(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
