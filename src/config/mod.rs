use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::{DownloadError, DownloadResult};

/// 最小分块大小与最小缓冲区大小（字节）
pub const MIN_CHUNK_SIZE: u64 = 1024;
pub const MIN_BUFFER_SIZE: usize = 1024;

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 下载线程池大小
    pub number_of_threads: usize,
    /// 分块大小（字节）
    pub chunk_size: u64,
    /// 连接超时（毫秒），0 表示不限制
    pub connection_timeout_ms: u64,
    /// 读取超时（毫秒），0 表示不限制
    pub read_timeout_ms: u64,
    /// 每个分块的最大尝试次数，0 仍会尝试一次
    pub max_retries: usize,
    /// 重试间隔（毫秒）
    pub retry_delay_ms: u64,
    /// 分块临时文件目录
    pub temp_directory: PathBuf,
    /// 读缓冲区大小（字节）
    pub buffer_size: usize,
    /// 文件小于该值时不分块
    pub min_size_for_chunking: u64,
    /// User-Agent
    pub user_agent: String,
    /// 下载管理器持久化文件
    pub state_file: PathBuf,
    /// 附加请求头，HEAD 请求和分块请求都会带上
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            number_of_threads: 16,
            chunk_size: 5 * 1024 * 1024,
            connection_timeout_ms: 30_000,
            read_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 2_000,
            temp_directory: std::env::temp_dir(),
            buffer_size: 8192,
            min_size_for_chunking: 1024 * 1024,
            user_agent: "Mozilla/5.0".to_string(),
            state_file: PathBuf::from("downloads.json"),
            extra_headers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// 加载配置文件，不存在时写入一份带注释的默认配置
    pub fn load(path: impl AsRef<Path>) -> DownloadResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| DownloadError::Config(format!("配置文件格式错误 {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置文件（带注释头）
    pub fn save(&self, path: impl AsRef<Path>) -> DownloadResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let body = toml::to_string_pretty(self)
            .map_err(|e| DownloadError::Config(format!("无法序列化配置: {}", e)))?;
        fs::write(path, format!("{}\n{}", Self::header(), body))?;
        Ok(())
    }

    fn header() -> &'static str {
        r#"# chunkdown 配置文件
# ====================
#
# number_of_threads      下载线程池大小，至少为 1
# chunk_size             分块大小（字节），至少 1024
# connection_timeout_ms  连接超时（毫秒），0 表示不限制
# read_timeout_ms        读取超时（毫秒），0 表示不限制
# max_retries            每个分块的最大尝试次数
# retry_delay_ms         两次尝试之间的间隔（毫秒）
# temp_directory         分块临时文件目录，不存在时自动创建
# buffer_size            读缓冲区大小（字节），至少 1024
# min_size_for_chunking  文件小于该值时整体下载，不分块
# user_agent             请求使用的 User-Agent
# state_file             下载管理器保存未完成任务的文件
# [extra_headers]        附加请求头，例如 Authorization = "Bearer ..."
"#
    }

    /// 校验配置合法性
    pub fn validate(&self) -> DownloadResult<()> {
        if self.number_of_threads == 0 {
            return Err(DownloadError::Config("线程数必须大于0".to_string()));
        }

        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(DownloadError::Config(format!(
                "分块大小不能小于 {} 字节, 当前 {}",
                MIN_CHUNK_SIZE, self.chunk_size
            )));
        }

        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(DownloadError::Config(format!(
                "缓冲区大小不能小于 {} 字节, 当前 {}",
                MIN_BUFFER_SIZE, self.buffer_size
            )));
        }

        if self.temp_directory.as_os_str().is_empty() {
            return Err(DownloadError::Config("临时目录不能为空".to_string()));
        }

        if self.user_agent.trim().is_empty() {
            return Err(DownloadError::Config("User-Agent 不能为空".to_string()));
        }

        Ok(())
    }

    /// 确保临时目录存在
    pub fn ensure_temp_directory(&self) -> DownloadResult<()> {
        fs::create_dir_all(&self.temp_directory).map_err(|e| {
            DownloadError::Config(format!(
                "无法创建临时目录 {}: {}",
                self.temp_directory.display(),
                e
            ))
        })
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_ms > 0).then(|| Duration::from_millis(self.connection_timeout_ms))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn with_number_of_threads(mut self, threads: usize) -> Self {
        self.number_of_threads = threads;
        self
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_chunk_size_mb(self, mb: u64) -> Self {
        self.with_chunk_size(mb * 1024 * 1024)
    }

    pub fn with_timeouts_ms(mut self, connection_ms: u64, read_ms: u64) -> Self {
        self.connection_timeout_ms = connection_ms;
        self.read_timeout_ms = read_ms;
        self
    }

    pub fn with_timeouts_secs(self, connection_secs: u64, read_secs: u64) -> Self {
        self.with_timeouts_ms(connection_secs * 1000, read_secs * 1000)
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_temp_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_directory = dir.into();
        self
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn with_min_size_for_chunking(mut self, bytes: u64) -> Self {
        self.min_size_for_chunking = bytes;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = path.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// 获取配置摘要信息
    pub fn summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 线程数: {}\n\
            - 分块大小: {} 字节\n\
            - 分块阈值: {} 字节\n\
            - 连接超时: {}\n\
            - 读取超时: {}\n\
            - 重试次数: {} (间隔 {} 毫秒)\n\
            - 缓冲区: {} 字节\n\
            - 临时目录: {}\n\
            - 附加请求头: {} 个",
            self.number_of_threads,
            self.chunk_size,
            self.min_size_for_chunking,
            Self::describe_timeout(self.connection_timeout_ms),
            Self::describe_timeout(self.read_timeout_ms),
            self.max_retries,
            self.retry_delay_ms,
            self.buffer_size,
            self.temp_directory.display(),
            self.extra_headers.len()
        )
    }

    fn describe_timeout(ms: u64) -> String {
        if ms == 0 {
            "不限制".to_string()
        } else {
            format!("{} 毫秒", ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.number_of_threads, 16);
        assert_eq!(config.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.connection_timeout_ms, 30_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 2_000);
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.min_size_for_chunking, 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::default().with_number_of_threads(0).validate().is_err());
        assert!(Config::default().with_chunk_size(1023).validate().is_err());
        assert!(Config::default().with_chunk_size(1024).validate().is_ok());
        assert!(Config::default().with_buffer_size(512).validate().is_err());
        assert!(Config::default().with_temp_directory("").validate().is_err());

        // 超时、重试次数和分块阈值允许为 0
        let config = Config::default()
            .with_timeouts_ms(0, 0)
            .with_max_retries(0)
            .with_retry_delay_ms(0)
            .with_min_size_for_chunking(0);
        assert!(config.validate().is_ok());
        assert_eq!(config.connection_timeout(), None);
        assert_eq!(config.read_timeout(), None);
    }

    #[test]
    fn test_convenience_setters() {
        let config = Config::default().with_chunk_size_mb(2).with_timeouts_secs(5, 10);
        assert_eq!(config.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.connection_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunkdown.toml");

        let config = Config::default()
            .with_number_of_threads(4)
            .with_chunk_size(4096)
            .with_temp_directory(dir.path().join("tmp"))
            .with_header("Authorization", "Bearer token");
        config.save(&path).expect("保存配置失败");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("chunkdown 配置文件"));

        let loaded = Config::load(&path).expect("加载配置失败");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_writes_default_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("chunkdown.toml");

        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_load_partial_and_invalid_files() {
        let dir = tempdir().unwrap();
        let partial = dir.path().join("partial.toml");
        fs::write(&partial, "number_of_threads = 2\nchunk_size = 2048\n").unwrap();
        let config = Config::load(&partial).unwrap();
        assert_eq!(config.number_of_threads, 2);
        assert_eq!(config.chunk_size, 2048);
        assert_eq!(config.buffer_size, 8192);

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "number_of_threads = \"many\"").unwrap();
        assert!(matches!(Config::load(&broken), Err(DownloadError::Config(_))));

        let out_of_bounds = dir.path().join("bounds.toml");
        fs::write(&out_of_bounds, "buffer_size = 16").unwrap();
        assert!(Config::load(&out_of_bounds).is_err());
    }

    #[test]
    fn test_config_summary() {
        let summary = Config::default().with_timeouts_ms(0, 1500).summary();
        assert!(summary.contains("配置摘要"));
        assert!(summary.contains("线程数: 16"));
        assert!(summary.contains("不限制"));
        assert!(summary.contains("1500 毫秒"));
    }
}
