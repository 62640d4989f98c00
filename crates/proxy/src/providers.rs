use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crawler_core::models::{ProxyInfo, ProxyType};
use crawler_core::{CrawlerError, PremiumProviderConfig, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})$").expect("Invalid IP:PORT regex")
});

static SCHEME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks[45])://([^:/]+):(\d{1,5})$").expect("Invalid scheme regex")
});

static AUTH_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^:]+):(\d{1,5}):([^:]+):(.+)$").expect("Invalid auth regex")
});

/// 代理提供者接口
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    fn name(&self) -> &str;

    /// 获取候选代理列表，此处不做验证
    async fn fetch_proxies(&self, limit: usize) -> Result<Vec<ProxyInfo>>;
}

fn scheme_to_type(scheme: &str) -> ProxyType {
    match scheme {
        "https" => ProxyType::Https,
        "socks4" => ProxyType::Socks4,
        "socks5" => ProxyType::Socks5,
        _ => ProxyType::Http,
    }
}

/// 从源URL推断它提供的代理类型
fn proxy_type_from_url(url: &str) -> ProxyType {
    let url = url.to_lowercase();
    if url.contains("socks5") {
        ProxyType::Socks5
    } else if url.contains("socks4") {
        ProxyType::Socks4
    } else if url.contains("https") {
        ProxyType::Https
    } else {
        ProxyType::Http
    }
}

/// 解析单行代理描述
///
/// 支持 host:port、scheme://host:port、host:port:user:pass 和JSON记录。
pub fn parse_proxy_line(line: &str, default_type: ProxyType, source: &str) -> Option<ProxyInfo> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(caps) = IP_PORT_REGEX.captures(line) {
        let port: u16 = caps[2].parse().ok()?;
        return Some(ProxyInfo::new(&caps[1], port, default_type).with_source(source));
    }

    if let Some(caps) = SCHEME_REGEX.captures(line) {
        let port: u16 = caps[3].parse().ok()?;
        return Some(ProxyInfo::new(&caps[2], port, scheme_to_type(&caps[1])).with_source(source));
    }

    if let Some(caps) = AUTH_REGEX.captures(line) {
        let port: u16 = caps[2].parse().ok()?;
        return Some(
            ProxyInfo::new(&caps[1], port, default_type)
                .with_auth(&caps[3], &caps[4])
                .with_source(source),
        );
    }

    if line.starts_with('{') && line.ends_with('}') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            return parse_json_record(&value, default_type, source);
        }
    }

    None
}

fn parse_json_record(
    value: &serde_json::Value,
    default_type: ProxyType,
    source: &str,
) -> Option<ProxyInfo> {
    let host = value
        .get("host")
        .or_else(|| value.get("ip"))
        .or_else(|| value.get("address"))?
        .as_str()?;
    let port = value.get("port")?.as_u64()? as u16;

    let proxy_type = value
        .get("type")
        .or_else(|| value.get("protocol"))
        .and_then(|t| t.as_str())
        .map(scheme_to_type)
        .unwrap_or(default_type);

    let mut proxy = ProxyInfo::new(host, port, proxy_type).with_source(source);
    if let (Some(user), Some(pass)) = (
        value.get("username").and_then(|v| v.as_str()),
        value.get("password").and_then(|v| v.as_str()),
    ) {
        proxy = proxy.with_auth(user, pass);
    }
    proxy.country = value
        .get("country")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Some(proxy)
}

/// 解析整份代理列表文本并按(host, port)去重
pub fn parse_proxy_list(content: &str, default_type: ProxyType, source: &str) -> Vec<ProxyInfo> {
    let mut seen: HashSet<String> = HashSet::new();
    content
        .lines()
        .filter_map(|line| parse_proxy_line(line, default_type, source))
        .filter(|proxy| seen.insert(proxy.key()))
        .collect()
}

/// 免费代理提供者
///
/// 从若干公开列表接口抓取纯文本代理清单。
pub struct FreeProxyProvider {
    client: reqwest::Client,
    api_urls: Vec<String>,
}

impl FreeProxyProvider {
    pub fn new() -> Self {
        let api_urls = vec![
            "https://api.proxyscrape.com/v2/?request=get&protocol=http&timeout=10000&country=all"
                .to_string(),
            "https://api.proxyscrape.com/v2/?request=get&protocol=socks5&timeout=10000&country=all"
                .to_string(),
            "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt".to_string(),
            "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/socks5.txt".to_string(),
            "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies/http.txt"
                .to_string(),
        ];
        Self::with_sources(api_urls)
    }

    pub fn with_sources(api_urls: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client, api_urls }
    }
}

impl Default for FreeProxyProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyProvider for FreeProxyProvider {
    fn name(&self) -> &str {
        "free"
    }

    async fn fetch_proxies(&self, limit: usize) -> Result<Vec<ProxyInfo>> {
        let mut all = Vec::new();

        for url in &self.api_urls {
            let default_type = proxy_type_from_url(url);
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    let text = response
                        .text()
                        .await
                        .map_err(|e| CrawlerError::Network(e.to_string()))?;
                    let proxies = parse_proxy_list(&text, default_type, self.name());
                    debug!("从 {} 获取到 {} 个代理", url, proxies.len());
                    all.extend(proxies);
                }
                Ok(response) => {
                    warn!("获取代理失败 {}: HTTP {}", url, response.status());
                }
                Err(e) => {
                    warn!("获取代理失败 {}: {}", url, e);
                }
            }
            // 对列表源保持克制，避免触发它们自己的限流
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        info!("从免费源获取到 {} 个代理", all.len());
        all.truncate(limit);
        Ok(all)
    }
}

/// 付费代理提供者
///
/// 认证方式和响应字段因服务商而异，这里做通用解析。
pub struct PremiumProxyProvider {
    config: PremiumProviderConfig,
    client: reqwest::Client,
    provider_name: String,
}

impl PremiumProxyProvider {
    pub fn new(config: PremiumProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent("ProxyPool/1.0")
            .build()
            .unwrap_or_default();
        let provider_name = format!("premium_{}", config.service_name);
        Self {
            config,
            client,
            provider_name,
        }
    }

    fn auth_header_value(&self) -> String {
        self.config
            .auth_format
            .replace("{api_key}", &self.config.api_key)
    }

    /// 解析通用的JSON代理响应
    pub(crate) fn parse_response(&self, data: &serde_json::Value) -> Vec<ProxyInfo> {
        let items = data
            .get("proxies")
            .or_else(|| data.get("data"))
            .or_else(|| data.get("results"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        items
            .iter()
            .filter_map(|item| parse_json_record(item, ProxyType::Http, &self.provider_name))
            .collect()
    }
}

#[async_trait]
impl ProxyProvider for PremiumProxyProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn fetch_proxies(&self, limit: usize) -> Result<Vec<ProxyInfo>> {
        let response = self
            .client
            .get(&self.config.api_url)
            .header(&self.config.auth_header, self.auth_header_value())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| CrawlerError::Network(format!("付费代理API请求失败: {e}")))?;

        if !response.status().is_success() {
            return Err(CrawlerError::Network(format!(
                "付费代理API请求失败: HTTP {}",
                response.status()
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CrawlerError::Network(e.to_string()))?;
        let mut proxies = self.parse_response(&data);
        info!("从付费源 {} 获取到 {} 个代理", self.provider_name, proxies.len());
        proxies.truncate(limit);
        Ok(proxies)
    }
}

/// 本地文件代理提供者
///
/// 读取换行分隔的 host:port[:user:pass] 文件。
pub struct LocalFileProvider {
    path: String,
}

impl LocalFileProvider {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProxyProvider for LocalFileProvider {
    fn name(&self) -> &str {
        "local_file"
    }

    async fn fetch_proxies(&self, limit: usize) -> Result<Vec<ProxyInfo>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CrawlerError::Configuration(format!("读取代理文件失败 {}: {e}", self.path)))?;

        let mut proxies = parse_proxy_list(&content, ProxyType::Http, self.name());
        info!("从本地文件 {} 读取到 {} 个代理", self.path, proxies.len());
        proxies.truncate(limit);
        Ok(proxies)
    }
}
