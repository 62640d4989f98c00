use std::collections::HashMap;

/// 识别出的反爬虫机制类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKind {
    /// 挑战页（等待验证完成后重试）
    Challenge,
    /// 验证码，不做自动求解，按不可恢复处理
    Captcha,
    /// 频率限制（429或文案），等待并轮换代理
    RateLimit,
    /// IP封禁（403或文案），轮换代理
    Blocked,
    /// 通用机器人识别，下次尝试模拟人工交互
    BotDetection,
}

impl DetectionKind {
    /// 该类检测是否还有机会在后续尝试中绕过
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DetectionKind::Captcha)
    }
}

const CHALLENGE_PATTERNS: [&str; 3] = ["cloudflare", "cf-ray", "checking your browser"];
const CAPTCHA_PATTERNS: [&str; 4] = ["captcha", "recaptcha", "hcaptcha", "verify you are human"];
const RATE_LIMIT_PATTERNS: [&str; 2] = ["rate limit", "too many requests"];
const BLOCKED_PATTERNS: [&str; 3] = ["access denied", "forbidden", "blocked"];
const BOT_PATTERNS: [&str; 3] = ["bot detected", "automated traffic", "suspicious activity"];

/// 根据响应体、状态码和响应头判断是否触发了反爬虫机制
pub fn detect(
    content: &str,
    status_code: u16,
    headers: &HashMap<String, String>,
) -> Option<DetectionKind> {
    match status_code {
        429 => return Some(DetectionKind::RateLimit),
        403 => return Some(DetectionKind::Blocked),
        503 => return Some(DetectionKind::Challenge),
        _ => {}
    }

    for (key, value) in headers {
        let key = key.to_lowercase();
        if key.contains("cloudflare") || key.starts_with("cf-") {
            return Some(DetectionKind::Challenge);
        }
        if value.to_lowercase().contains("captcha") {
            return Some(DetectionKind::Captcha);
        }
    }

    let content = content.to_lowercase();
    // 验证码优先于挑战页判定，避免把带验证码的挑战页当成可等待的挑战
    if CAPTCHA_PATTERNS.iter().any(|p| content.contains(p)) {
        return Some(DetectionKind::Captcha);
    }
    if CHALLENGE_PATTERNS.iter().any(|p| content.contains(p)) {
        return Some(DetectionKind::Challenge);
    }
    if RATE_LIMIT_PATTERNS.iter().any(|p| content.contains(p)) {
        return Some(DetectionKind::RateLimit);
    }
    if BLOCKED_PATTERNS.iter().any(|p| content.contains(p)) {
        return Some(DetectionKind::Blocked);
    }
    if BOT_PATTERNS.iter().any(|p| content.contains(p)) {
        return Some(DetectionKind::BotDetection);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_clean_page_passes() {
        assert_eq!(detect("<html><body>hello</body></html>", 200, &no_headers()), None);
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            detect("", 429, &no_headers()),
            Some(DetectionKind::RateLimit)
        );
        assert_eq!(detect("", 403, &no_headers()), Some(DetectionKind::Blocked));
        assert_eq!(
            detect("", 503, &no_headers()),
            Some(DetectionKind::Challenge)
        );
    }

    #[test]
    fn test_challenge_header() {
        let mut headers = HashMap::new();
        headers.insert("CF-RAY".to_string(), "abc123".to_string());
        assert_eq!(detect("", 200, &headers), Some(DetectionKind::Challenge));
    }

    #[test]
    fn test_captcha_in_content_is_unrecoverable() {
        let kind = detect("please solve this reCAPTCHA to continue", 200, &no_headers()).unwrap();
        assert_eq!(kind, DetectionKind::Captcha);
        assert!(!kind.is_recoverable());
    }

    #[test]
    fn test_captcha_takes_precedence_over_challenge() {
        let content = "cloudflare checking your browser, solve the captcha below";
        assert_eq!(
            detect(content, 200, &no_headers()),
            Some(DetectionKind::Captcha)
        );
    }

    #[test]
    fn test_bot_detection_phrasing() {
        let kind = detect(
            "we noticed automated traffic from your network",
            200,
            &no_headers(),
        )
        .unwrap();
        assert_eq!(kind, DetectionKind::BotDetection);
        assert!(kind.is_recoverable());
    }

    #[test]
    fn test_rate_limit_phrasing() {
        assert_eq!(
            detect("Too Many Requests, slow down", 200, &no_headers()),
            Some(DetectionKind::RateLimit)
        );
    }
}
