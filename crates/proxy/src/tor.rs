use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crawler_core::models::{ProxyInfo, ProxyType};
use crawler_core::{CrawlerError, Result, TorConfig};

use crate::providers::ProxyProvider;

/// Tor代理提供者
///
/// 把本机Tor的SOCKS5端点作为一个普通候选代理注入池中，
/// 与其他来源一起参与验证和轮换。
pub struct TorProvider {
    config: TorConfig,
}

impl TorProvider {
    pub fn new(config: TorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProxyProvider for TorProvider {
    fn name(&self) -> &str {
        "tor"
    }

    async fn fetch_proxies(&self, _limit: usize) -> Result<Vec<ProxyInfo>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        let proxy = ProxyInfo::new(
            &self.config.socks_host,
            self.config.socks_port,
            ProxyType::Socks5,
        )
        .with_source(self.name());
        Ok(vec![proxy])
    }
}

/// Tor控制端口客户端
///
/// 只实现电路轮换需要的最小命令集：AUTHENTICATE和SIGNAL NEWNYM。
pub struct TorController {
    config: TorConfig,
}

impl TorController {
    pub fn new(config: TorConfig) -> Self {
        Self { config }
    }

    fn auth_command(&self) -> String {
        match &self.config.control_password {
            Some(password) => format!("AUTHENTICATE \"{password}\"\r\n"),
            None => "AUTHENTICATE\r\n".to_string(),
        }
    }

    /// 请求新电路（换一个出口IP）
    pub async fn new_identity(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.socks_host, self.config.control_port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| CrawlerError::Network(format!("连接Tor控制端口失败 {addr}: {e}")))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(self.auth_command().as_bytes())
            .await
            .map_err(|e| CrawlerError::Network(e.to_string()))?;
        Self::expect_ok(&mut reader, "AUTHENTICATE").await?;

        write_half
            .write_all(b"SIGNAL NEWNYM\r\n")
            .await
            .map_err(|e| CrawlerError::Network(e.to_string()))?;
        Self::expect_ok(&mut reader, "SIGNAL NEWNYM").await?;

        let _ = write_half.write_all(b"QUIT\r\n").await;
        info!("Tor电路已轮换");
        Ok(())
    }

    async fn expect_ok<R>(reader: &mut BufReader<R>, command: &str) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| CrawlerError::Network(e.to_string()))?;
        debug!("Tor控制端口响应: {}", line.trim_end());
        if line.starts_with("250") {
            Ok(())
        } else {
            Err(CrawlerError::Network(format!(
                "Tor {command} 失败: {}",
                line.trim_end()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_tor_yields_no_proxies() {
        let provider = TorProvider::new(TorConfig::default());
        assert!(provider.fetch_proxies(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enabled_tor_yields_socks5_endpoint() {
        let provider = TorProvider::new(TorConfig {
            enabled: true,
            ..TorConfig::default()
        });
        let proxies = provider.fetch_proxies(10).await.unwrap();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].proxy_type, ProxyType::Socks5);
        assert_eq!(proxies[0].port, 9050);
        assert_eq!(proxies[0].proxy_url(), "socks5://127.0.0.1:9050");
    }

    #[test]
    fn test_auth_command_formats() {
        let controller = TorController::new(TorConfig::default());
        assert_eq!(controller.auth_command(), "AUTHENTICATE\r\n");

        let controller = TorController::new(TorConfig {
            control_password: Some("pw".to_string()),
            ..TorConfig::default()
        });
        assert_eq!(controller.auth_command(), "AUTHENTICATE \"pw\"\r\n");
    }
}
