use chrono::Local; // 用于获取本地时间
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 带大小轮转的日志文件
struct LogFile {
    writer: BufWriter<File>,
    file_path: PathBuf,
    max_size: u64, // 最大文件大小 (bytes)
    current_size: u64,
}

impl LogFile {
    fn open(file_path: &Path, max_size: u64) -> std::io::Result<Self> {
        // 确保日志目录存在
        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            writer: BufWriter::new(file),
            file_path: file_path.to_path_buf(),
            max_size,
            current_size,
        })
    }

    fn backup_path(&self) -> PathBuf {
        let mut backup = self.file_path.clone().into_os_string();
        backup.push(".backup");
        PathBuf::from(backup)
    }

    /// 检查并执行日志轮转
    fn check_rotation(&mut self) -> std::io::Result<()> {
        if self.current_size <= self.max_size {
            return Ok(());
        }

        self.writer.flush()?;

        let backup_path = self.backup_path();
        if backup_path.exists() {
            std::fs::remove_file(&backup_path)?;
        }
        std::fs::rename(&self.file_path, &backup_path)?;

        let file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        self.writer = BufWriter::new(file);
        self.current_size = 0;
        Ok(())
    }

    fn write_entry(&mut self, entry: &str) -> std::io::Result<()> {
        self.check_rotation()?;
        self.writer.write_all(entry.as_bytes())?;
        self.current_size += entry.len() as u64;

        // 定期刷新缓冲区
        if self.current_size % 1024 < entry.len() as u64 {
            self.writer.flush()?;
        }
        Ok(())
    }
}

/// 文件日志，实现 `log::Log`，可作为全局 logger 安装
pub struct FileLogger {
    level: LevelFilter,
    file: Mutex<LogFile>,
}

impl FileLogger {
    pub fn new(file_path: impl AsRef<Path>, level: LevelFilter, max_size: u64) -> std::io::Result<Self> {
        Ok(Self {
            level,
            file: Mutex::new(LogFile::open(file_path.as_ref(), max_size)?),
        })
    }

    fn format_entry(record: &Record) -> String {
        format!(
            "{} [{}] {} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let entry = Self::format_entry(record);
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = file.write_entry(&entry) {
                eprintln!("日志写入失败: {}", e);
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.writer.flush();
        }
    }
}

/// 安装全局文件日志
pub fn init_file_logger(file_path: impl AsRef<Path>, level: LevelFilter, max_size: u64) -> anyhow::Result<()> {
    let logger = FileLogger::new(file_path.as_ref(), level, max_size)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level);
    Ok(())
}

/// 测试和临时运行用的控制台日志，重复调用是安全的
pub fn init_test_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(LevelFilter::Debug)
        .try_init();
}
