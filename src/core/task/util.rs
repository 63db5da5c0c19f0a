use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::error::{DownloadError, DownloadResult};

/// 文件信息结构
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub size: u64,
    pub supports_range: bool,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// 按配置构建 HTTP 客户端：超时、User-Agent 和附加请求头
pub fn build_client(config: &Config) -> DownloadResult<Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.extra_headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DownloadError::Config(format!("无效的请求头名称 {}: {}", name, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| DownloadError::Config(format!("无效的请求头 {} 的值: {}", name, e)))?;
        headers.insert(header_name, header_value);
    }

    let mut builder = Client::builder()
        .user_agent(config.user_agent.as_str())
        .default_headers(headers);
    if let Some(timeout) = config.connection_timeout() {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(timeout) = config.read_timeout() {
        builder = builder.read_timeout(timeout);
    }
    Ok(builder.build()?)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// 发送 HEAD 请求获取文件大小和范围请求支持情况
pub async fn probe_file_info(client: &Client, url: &str) -> DownloadResult<FileInfo> {
    let response = client.head(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::UnexpectedStatus {
            status: status.as_u16(),
            expected: 200,
        });
    }

    let headers = response.headers();
    // HEAD 响应没有响应体，不能用 response.content_length()
    let raw_length = header_str(headers, &CONTENT_LENGTH)
        .ok_or_else(|| DownloadError::InvalidContentLength("响应缺少 Content-Length".to_string()))?;
    let size = raw_length
        .trim()
        .parse::<u64>()
        .map_err(|_| DownloadError::InvalidContentLength(raw_length.to_string()))?;
    if size == 0 {
        return Err(DownloadError::InvalidContentLength(raw_length.to_string()));
    }

    let supports_range = header_str(headers, &ACCEPT_RANGES)
        .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
        .unwrap_or(false);

    Ok(FileInfo {
        size,
        supports_range,
        last_modified: header_str(headers, &LAST_MODIFIED).map(str::to_string),
        etag: header_str(headers, &ETAG).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn head_response(size: usize) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-length", size.to_string())
            .set_body_bytes(vec![0u8; size])
    }

    #[tokio::test]
    async fn test_probe_reads_size_and_range_support() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file.bin"))
            .respond_with(
                head_response(12_345)
                    .insert_header("accept-ranges", "Bytes")
                    .insert_header("etag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let client = build_client(&Config::default()).unwrap();
        let info = probe_file_info(&client, &format!("{}/file.bin", server.uri()))
            .await
            .unwrap();

        assert_eq!(info.size, 12_345);
        assert!(info.supports_range);
        assert_eq!(info.etag.as_deref(), Some("\"v1\""));
        assert!(info.last_modified.is_none());
    }

    #[tokio::test]
    async fn test_probe_without_accept_ranges() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/plain"))
            .respond_with(head_response(10))
            .mount(&server)
            .await;

        let client = build_client(&Config::default()).unwrap();
        let info = probe_file_info(&client, &format!("{}/plain", server.uri()))
            .await
            .unwrap();
        assert_eq!(info.size, 10);
        assert!(!info.supports_range);
    }

    #[tokio::test]
    async fn test_probe_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = build_client(&Config::default()).unwrap();
        let err = probe_file_info(&client, &format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::UnexpectedStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_probe_rejects_empty_resource() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = build_client(&Config::default()).unwrap();
        let err = probe_file_info(&client, &format!("{}/empty", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidContentLength(_)));
    }

    #[tokio::test]
    async fn test_client_sends_configured_headers() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(header("user-agent", "chunkdown-test"))
            .and(header("x-token", "secret"))
            .respond_with(head_response(64).insert_header("accept-ranges", "bytes"))
            .expect(1)
            .mount(&server)
            .await;

        let config = Config::default()
            .with_user_agent("chunkdown-test")
            .with_header("X-Token", "secret");
        let client = build_client(&config).unwrap();
        let info = probe_file_info(&client, &server.uri()).await.unwrap();
        assert_eq!(info.size, 64);
    }

    #[test]
    fn test_build_client_rejects_bad_header() {
        let config = Config::default().with_header("bad header", "x");
        assert!(matches!(build_client(&config), Err(DownloadError::Config(_))));
    }
}
