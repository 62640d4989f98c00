use std::ffi::OsStr;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions};
use rand::seq::IndexedRandom;
use rand::Rng;
use tracing::debug;

use crawler_core::{CrawlerError, Result, StealthConfig};

/// 常见桌面Chrome的UA池，每次启动随机取一个
const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
];

const VIEWPORTS: [(u32, u32); 4] = [(1920, 1080), (1366, 768), (1536, 864), (1440, 900)];

/// 隐藏自动化痕迹的注入脚本：去掉webdriver标记，补齐plugins和languages
const STEALTH_JS: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(navigator, 'languages', { get: () => ['zh-CN', 'zh', 'en'] });
window.chrome = window.chrome || { runtime: {} };
"#;

/// 模拟人工交互：随机滚动和鼠标事件
const HUMAN_JS: &str = r#"
window.scrollTo(0, Math.floor(Math.random() * 500) + 100);
document.dispatchEvent(new MouseEvent('mousemove', {
    clientX: Math.floor(Math.random() * 800) + 100,
    clientY: Math.floor(Math.random() * 600) + 100,
}));
"#;

/// 一次浏览器抓取的产物
#[derive(Debug, Clone)]
pub struct PageFetch {
    pub content: String,
    pub final_url: String,
}

/// 页面抓取接口，浏览器实现之外便于在测试中替换
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        proxy_url: Option<String>,
        simulate_human: bool,
    ) -> Result<PageFetch>;
}

/// 无头浏览器管理器
///
/// 代理绑定是启动参数，每次抓取按当前代理拉起一个独立的浏览器
/// 实例，结束即回收。CDP调用是阻塞的，统一放进spawn_blocking。
pub struct BrowserManager {
    config: StealthConfig,
}

impl BrowserManager {
    pub fn new(config: StealthConfig) -> Self {
        Self { config }
    }

    fn fetch_sync(
        config: &StealthConfig,
        url: &str,
        proxy_url: Option<&str>,
        simulate_human: bool,
    ) -> Result<PageFetch> {
        let mut rng = rand::rng();
        let user_agent = USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]);
        let viewport = VIEWPORTS.choose(&mut rng).copied().unwrap_or(VIEWPORTS[0]);

        let args: Vec<&OsStr> = vec![
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--no-first-run"),
        ];

        let options = LaunchOptions::default_builder()
            .headless(config.headless)
            .sandbox(false)
            .window_size(Some(viewport))
            .proxy_server(proxy_url)
            .args(args)
            .idle_browser_timeout(Duration::from_secs(
                config.navigation_timeout_seconds * 2,
            ))
            .build()
            .map_err(|e| CrawlerError::Browser(format!("构造浏览器启动参数失败: {e}")))?;

        let browser =
            Browser::new(options).map_err(|e| CrawlerError::Browser(format!("启动浏览器失败: {e}")))?;
        let tab = browser
            .new_tab()
            .map_err(|e| CrawlerError::Browser(e.to_string()))?;
        tab.set_default_timeout(Duration::from_secs(config.navigation_timeout_seconds));

        tab.set_user_agent(user_agent, Some("zh-CN,zh;q=0.9,en;q=0.8"), None)
            .map_err(|e| CrawlerError::Browser(e.to_string()))?;

        tab.navigate_to(url)
            .map_err(|e| CrawlerError::Browser(format!("导航失败: {e}")))?;
        tab.wait_until_navigated()
            .map_err(|e| CrawlerError::Browser(format!("等待页面加载失败: {e}")))?;

        if config.enable_stealth {
            if let Err(e) = tab.evaluate(STEALTH_JS, false) {
                debug!("注入stealth脚本失败: {}", e);
            }
        }

        if simulate_human {
            if let Err(e) = tab.evaluate(HUMAN_JS, false) {
                debug!("模拟人工交互失败: {}", e);
            }
            std::thread::sleep(Duration::from_millis(
                rand::rng().random_range(1000..3000),
            ));
        }

        let content = tab
            .get_content()
            .map_err(|e| CrawlerError::Browser(format!("读取页面内容失败: {e}")))?;
        let final_url = tab.get_url();

        Ok(PageFetch { content, final_url })
    }
}

#[async_trait]
impl PageFetcher for BrowserManager {
    async fn fetch(
        &self,
        url: &str,
        proxy_url: Option<String>,
        simulate_human: bool,
    ) -> Result<PageFetch> {
        let config = self.config.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            Self::fetch_sync(&config, &url, proxy_url.as_deref(), simulate_human)
        })
        .await
        .map_err(|e| CrawlerError::Internal(format!("浏览器任务被中断: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stealth_js_masks_webdriver() {
        assert!(STEALTH_JS.contains("webdriver"));
        assert!(STEALTH_JS.contains("plugins"));
    }

    #[test]
    fn test_user_agent_pool_is_desktop_chrome() {
        for ua in USER_AGENTS {
            assert!(ua.contains("Chrome/"));
            assert!(!ua.to_lowercase().contains("headless"));
        }
    }
}
