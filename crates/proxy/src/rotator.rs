use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::seq::IndexedRandom;
use rand::Rng;
use tracing::debug;

use crawler_core::models::{ProxyInfo, ProxyStatus};
use crawler_core::{CrawlerError, Result};

/// 每次失败增加的冷却时间（秒）
const COOLDOWN_PER_FAILURE_SECS: u64 = 30;
/// 冷却时间上限（秒）
const COOLDOWN_MAX_SECS: u64 = 300;
/// 自适应策略的性能统计窗口
const PERFORMANCE_WINDOW: Duration = Duration::from_secs(300);
/// 每个子策略保留的性能样本数
const PERFORMANCE_HISTORY_LIMIT: usize = 100;
/// 最快/最少使用策略的随机候选数，避免总是压在同一个代理上
const TOP_CANDIDATES: usize = 3;

/// 轮换策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RotationStrategy {
    RoundRobin,
    Random,
    Weighted,
    Fastest,
    LeastUsed,
    Geographic,
    Adaptive,
}

impl std::str::FromStr for RotationStrategy {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "round_robin" => Ok(RotationStrategy::RoundRobin),
            "random" => Ok(RotationStrategy::Random),
            "weighted" => Ok(RotationStrategy::Weighted),
            "fastest" => Ok(RotationStrategy::Fastest),
            "least_used" => Ok(RotationStrategy::LeastUsed),
            "geographic" => Ok(RotationStrategy::Geographic),
            "adaptive" => Ok(RotationStrategy::Adaptive),
            other => Err(CrawlerError::Configuration(format!(
                "不支持的轮换策略: {other}"
            ))),
        }
    }
}

/// 自适应策略可选的子策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SubStrategy {
    Fastest,
    LeastUsed,
    Weighted,
    Random,
}

const SUB_STRATEGIES: [SubStrategy; 4] = [
    SubStrategy::Fastest,
    SubStrategy::LeastUsed,
    SubStrategy::Weighted,
    SubStrategy::Random,
];

/// 选择上下文
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub target_domain: Option<String>,
    pub target_country: Option<String>,
    pub request_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct UsageRecord {
    uses: u64,
    successes: u64,
    failures: u64,
    last_used: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct PerfSample {
    at: Instant,
    success: bool,
    response_time: f64,
}

/// 代理轮换器
///
/// 维护按代理键的使用统计；所有策略共享冷却过滤，
/// 刚失败的代理在 min(失败次数*30s, 300s) 内不会被再次选中。
pub struct ProxyRotator {
    strategy: RotationStrategy,
    current_index: usize,
    country_index: usize,
    usage: HashMap<String, UsageRecord>,
    strategy_weights: HashMap<SubStrategy, f64>,
    performance: HashMap<SubStrategy, VecDeque<PerfSample>>,
    last_strategy: Option<SubStrategy>,
}

impl ProxyRotator {
    pub fn new(strategy: RotationStrategy) -> Self {
        let mut strategy_weights = HashMap::new();
        strategy_weights.insert(SubStrategy::Fastest, 0.3);
        strategy_weights.insert(SubStrategy::LeastUsed, 0.2);
        strategy_weights.insert(SubStrategy::Weighted, 0.3);
        strategy_weights.insert(SubStrategy::Random, 0.2);

        Self {
            strategy,
            current_index: 0,
            country_index: 0,
            usage: HashMap::new(),
            strategy_weights,
            performance: HashMap::new(),
            last_strategy: None,
        }
    }

    pub fn strategy(&self) -> RotationStrategy {
        self.strategy
    }

    fn cooldown_for(failures: u64) -> Duration {
        Duration::from_secs((failures * COOLDOWN_PER_FAILURE_SECS).min(COOLDOWN_MAX_SECS))
    }

    /// 过滤出当前可用的代理：状态Active且不处于失败冷却期
    fn filter_available<'a>(&self, proxies: &'a [ProxyInfo], now: Instant) -> Vec<&'a ProxyInfo> {
        proxies
            .iter()
            .filter(|proxy| {
                if proxy.status != ProxyStatus::Active {
                    return false;
                }
                let record = match self.usage.get(&proxy.key()) {
                    Some(record) => record,
                    None => return true,
                };
                if record.failures == 0 {
                    return true;
                }
                match record.last_used {
                    Some(last_used) => {
                        now.duration_since(last_used) >= Self::cooldown_for(record.failures)
                    }
                    None => true,
                }
            })
            .collect()
    }

    /// 代理综合评分，权重策略使用
    fn score(&self, proxy: &ProxyInfo, now: Instant) -> f64 {
        let record = self.usage.get(&proxy.key());
        let mut score = 100.0;

        if let Some(record) = record {
            if record.uses > 0 {
                score *= record.successes as f64 / record.uses as f64;
            }
            score -= (record.uses as f64 * 0.1).min(20.0);
            if let Some(last_used) = record.last_used {
                if now.duration_since(last_used) < Duration::from_secs(60) {
                    score -= 10.0;
                }
            }
        }

        if proxy.response_time > 0.0 {
            score += (10.0 - proxy.response_time).max(0.0) * 10.0;
        }

        score.max(0.0)
    }

    /// 记录一次使用结果
    pub fn record_usage(&mut self, proxy_key: &str, success: bool, response_time: Option<f64>) {
        let record = self.usage.entry(proxy_key.to_string()).or_default();
        record.uses += 1;
        record.last_used = Some(Instant::now());
        if success {
            record.successes += 1;
        } else {
            record.failures += 1;
        }

        // 反馈给自适应策略
        if let Some(sub) = self.last_strategy {
            let history = self.performance.entry(sub).or_default();
            history.push_back(PerfSample {
                at: Instant::now(),
                success,
                response_time: response_time.unwrap_or(0.0),
            });
            while history.len() > PERFORMANCE_HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    /// 按当前策略选择一个代理
    pub fn select(&mut self, proxies: &[ProxyInfo], ctx: &SelectionContext) -> Option<ProxyInfo> {
        let now = Instant::now();
        let available = self.filter_available(proxies, now);
        if available.is_empty() {
            return None;
        }

        match self.strategy {
            RotationStrategy::RoundRobin => self.select_round_robin(&available),
            RotationStrategy::Random => Self::select_random(&available),
            RotationStrategy::Weighted => self.select_weighted(&available, now),
            RotationStrategy::Fastest => Self::select_fastest(&available),
            RotationStrategy::LeastUsed => self.select_least_used(&available),
            RotationStrategy::Geographic => self.select_geographic(&available, ctx),
            RotationStrategy::Adaptive => self.select_adaptive(&available, now),
        }
    }

    fn select_round_robin(&mut self, available: &[&ProxyInfo]) -> Option<ProxyInfo> {
        let proxy = available[self.current_index % available.len()];
        self.current_index = self.current_index.wrapping_add(1);
        Some(proxy.clone())
    }

    fn select_random(available: &[&ProxyInfo]) -> Option<ProxyInfo> {
        let mut rng = rand::rng();
        available.choose(&mut rng).map(|p| (*p).clone())
    }

    fn select_weighted(&self, available: &[&ProxyInfo], now: Instant) -> Option<ProxyInfo> {
        let weights: Vec<f64> = available
            .iter()
            .map(|proxy| self.score(proxy, now).max(1.0))
            .collect();
        let total: f64 = weights.iter().sum();

        let mut rng = rand::rng();
        let mut remaining = rng.random_range(0.0..total);
        for (proxy, weight) in available.iter().zip(weights.iter()) {
            remaining -= weight;
            if remaining <= 0.0 {
                return Some((*proxy).clone());
            }
        }
        available.last().map(|p| (*p).clone())
    }

    fn select_fastest(available: &[&ProxyInfo]) -> Option<ProxyInfo> {
        let mut sorted: Vec<&&ProxyInfo> = available.iter().collect();
        sorted.sort_by(|a, b| {
            let ta = if a.response_time > 0.0 {
                a.response_time
            } else {
                f64::INFINITY
            };
            let tb = if b.response_time > 0.0 {
                b.response_time
            } else {
                f64::INFINITY
            };
            ta.partial_cmp(&tb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let top = &sorted[..TOP_CANDIDATES.min(sorted.len())];
        let mut rng = rand::rng();
        top.choose(&mut rng).map(|p| (***p).clone())
    }

    fn select_least_used(&self, available: &[&ProxyInfo]) -> Option<ProxyInfo> {
        let mut sorted: Vec<&&ProxyInfo> = available.iter().collect();
        sorted.sort_by_key(|proxy| {
            self.usage
                .get(&proxy.key())
                .map(|record| record.uses)
                .unwrap_or(0)
        });

        let top = &sorted[..TOP_CANDIDATES.min(sorted.len())];
        let mut rng = rand::rng();
        top.choose(&mut rng).map(|p| (***p).clone())
    }

    fn select_geographic(
        &mut self,
        available: &[&ProxyInfo],
        ctx: &SelectionContext,
    ) -> Option<ProxyInfo> {
        if let Some(target) = &ctx.target_country {
            let matching: Vec<&&ProxyInfo> = available
                .iter()
                .filter(|proxy| {
                    proxy
                        .country
                        .as_ref()
                        .map(|c| c.eq_ignore_ascii_case(target))
                        .unwrap_or(false)
                })
                .collect();
            if !matching.is_empty() {
                let mut rng = rand::rng();
                return matching.choose(&mut rng).map(|p| (***p).clone());
            }
        }

        // 按国家分组轮换，键排序保证轮换顺序稳定
        let mut groups: HashMap<String, Vec<&&ProxyInfo>> = HashMap::new();
        for proxy in available {
            let country = proxy
                .country
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            groups.entry(country).or_default().push(proxy);
        }
        let mut countries: Vec<String> = groups.keys().cloned().collect();
        countries.sort();

        let country = &countries[self.country_index % countries.len()];
        self.country_index = self.country_index.wrapping_add(1);

        let mut rng = rand::rng();
        groups[country].choose(&mut rng).map(|p| (***p).clone())
    }

    /// 自适应元策略：根据近期表现在子策略间做加权随机选择
    fn select_adaptive(&mut self, available: &[&ProxyInfo], now: Instant) -> Option<ProxyInfo> {
        self.adjust_strategy_weights(now);

        let total: f64 = self.strategy_weights.values().sum();
        let mut rng = rand::rng();
        let mut remaining = rng.random_range(0.0..total.max(f64::MIN_POSITIVE));
        let mut selected = SubStrategy::Random;
        for sub in SUB_STRATEGIES {
            let weight = self.strategy_weights.get(&sub).copied().unwrap_or(0.0);
            remaining -= weight;
            if remaining <= 0.0 {
                selected = sub;
                break;
            }
        }
        self.last_strategy = Some(selected);
        debug!("自适应策略选择了子策略: {:?}", selected);

        match selected {
            SubStrategy::Fastest => Self::select_fastest(available),
            SubStrategy::LeastUsed => self.select_least_used(available),
            SubStrategy::Weighted => self.select_weighted(available, now),
            SubStrategy::Random => Self::select_random(available),
        }
    }

    fn adjust_strategy_weights(&mut self, now: Instant) {
        let mut scores: HashMap<SubStrategy, f64> = HashMap::new();

        for sub in SUB_STRATEGIES {
            let recent: Vec<&PerfSample> = self
                .performance
                .get(&sub)
                .map(|history| {
                    history
                        .iter()
                        .filter(|sample| now.duration_since(sample.at) < PERFORMANCE_WINDOW)
                        .collect()
                })
                .unwrap_or_default();

            let score = if recent.is_empty() {
                50.0
            } else {
                let success_rate = recent.iter().filter(|s| s.success).count() as f64
                    / recent.len() as f64;
                let avg_response_time: f64 =
                    recent.iter().map(|s| s.response_time).sum::<f64>() / recent.len() as f64;
                (success_rate * 100.0 - avg_response_time * 10.0).max(0.0)
            };
            scores.insert(sub, score);
        }

        let total: f64 = scores.values().sum();
        if total > 0.0 {
            for sub in SUB_STRATEGIES {
                self.strategy_weights.insert(sub, scores[&sub] / total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawler_core::models::ProxyType;

    fn active_proxy(host: &str, response_time: f64) -> ProxyInfo {
        let mut proxy = ProxyInfo::new(host, 8080, ProxyType::Http);
        proxy.status = ProxyStatus::Active;
        proxy.response_time = response_time;
        proxy
    }

    #[test]
    fn test_strategy_parsing() {
        use std::str::FromStr;
        assert_eq!(
            RotationStrategy::from_str("round_robin").unwrap(),
            RotationStrategy::RoundRobin
        );
        assert_eq!(
            RotationStrategy::from_str("ADAPTIVE").unwrap(),
            RotationStrategy::Adaptive
        );
        assert!(RotationStrategy::from_str("quantum").is_err());
    }

    #[test]
    fn test_round_robin_cycles() {
        let mut rotator = ProxyRotator::new(RotationStrategy::RoundRobin);
        let proxies = vec![active_proxy("a", 1.0), active_proxy("b", 1.0)];
        let ctx = SelectionContext::default();

        let first = rotator.select(&proxies, &ctx).unwrap();
        let second = rotator.select(&proxies, &ctx).unwrap();
        let third = rotator.select(&proxies, &ctx).unwrap();
        assert_ne!(first.host, second.host);
        assert_eq!(first.host, third.host);
    }

    #[test]
    fn test_no_active_proxies_gives_none() {
        let mut rotator = ProxyRotator::new(RotationStrategy::Random);
        let mut proxy = active_proxy("a", 1.0);
        proxy.status = ProxyStatus::Failed;
        assert!(rotator
            .select(&[proxy], &SelectionContext::default())
            .is_none());
    }

    #[test]
    fn test_failed_proxy_enters_cooldown() {
        let mut rotator = ProxyRotator::new(RotationStrategy::RoundRobin);
        let proxies = vec![active_proxy("a", 1.0)];
        let ctx = SelectionContext::default();

        assert!(rotator.select(&proxies, &ctx).is_some());
        rotator.record_usage("a:8080", false, None);

        // 冷却期内不会被再次选中
        assert!(rotator.select(&proxies, &ctx).is_none());
    }

    #[test]
    fn test_cooldown_only_affects_failed_proxy() {
        let mut rotator = ProxyRotator::new(RotationStrategy::RoundRobin);
        let proxies = vec![active_proxy("a", 1.0), active_proxy("b", 1.0)];
        let ctx = SelectionContext::default();

        rotator.record_usage("a:8080", false, None);
        for _ in 0..5 {
            let selected = rotator.select(&proxies, &ctx).unwrap();
            assert_eq!(selected.host, "b");
        }
    }

    #[test]
    fn test_successful_usage_does_not_cool_down() {
        let mut rotator = ProxyRotator::new(RotationStrategy::RoundRobin);
        let proxies = vec![active_proxy("a", 1.0)];
        rotator.record_usage("a:8080", true, Some(0.5));
        assert!(rotator
            .select(&proxies, &SelectionContext::default())
            .is_some());
    }

    #[test]
    fn test_fastest_prefers_quick_proxies() {
        let mut rotator = ProxyRotator::new(RotationStrategy::Fastest);
        let mut proxies = vec![
            active_proxy("slow1", 8.0),
            active_proxy("slow2", 9.0),
            active_proxy("slow3", 7.0),
            active_proxy("fast", 0.1),
        ];
        proxies.push(active_proxy("medium", 2.0));

        // fast一定在前3候选里，slow2永远不会被选中
        for _ in 0..20 {
            let selected = rotator
                .select(&proxies, &SelectionContext::default())
                .unwrap();
            assert_ne!(selected.host, "slow2");
            assert_ne!(selected.host, "slow1");
        }
    }

    #[test]
    fn test_least_used_avoids_hot_proxy() {
        let mut rotator = ProxyRotator::new(RotationStrategy::LeastUsed);
        let proxies = vec![
            active_proxy("hot1", 1.0),
            active_proxy("hot2", 1.0),
            active_proxy("hot3", 1.0),
            active_proxy("cold", 1.0),
        ];
        for _ in 0..10 {
            rotator.record_usage("hot1:8080", true, Some(0.2));
            rotator.record_usage("hot2:8080", true, Some(0.2));
            rotator.record_usage("hot3:8080", true, Some(0.2));
        }

        // 使用次数最多的三个里只会有两个进入top3，hot里至少有一个被排除
        for _ in 0..20 {
            let selected = rotator
                .select(&proxies, &SelectionContext::default())
                .unwrap();
            assert_ne!(selected.host, "hot3");
        }
    }

    #[test]
    fn test_geographic_prefers_target_country() {
        let mut rotator = ProxyRotator::new(RotationStrategy::Geographic);
        let mut us = active_proxy("us-proxy", 1.0);
        us.country = Some("US".to_string());
        let mut de = active_proxy("de-proxy", 1.0);
        de.country = Some("DE".to_string());

        let ctx = SelectionContext {
            target_country: Some("de".to_string()),
            ..SelectionContext::default()
        };
        for _ in 0..10 {
            let selected = rotator.select(&[us.clone(), de.clone()], &ctx).unwrap();
            assert_eq!(selected.host, "de-proxy");
        }
    }

    #[test]
    fn test_geographic_rotates_countries_without_target() {
        let mut rotator = ProxyRotator::new(RotationStrategy::Geographic);
        let mut us = active_proxy("us-proxy", 1.0);
        us.country = Some("US".to_string());
        let mut de = active_proxy("de-proxy", 1.0);
        de.country = Some("DE".to_string());
        let proxies = vec![us, de];

        let ctx = SelectionContext::default();
        let first = rotator.select(&proxies, &ctx).unwrap();
        let second = rotator.select(&proxies, &ctx).unwrap();
        assert_ne!(first.country, second.country);
    }

    #[test]
    fn test_weighted_returns_some() {
        let mut rotator = ProxyRotator::new(RotationStrategy::Weighted);
        let proxies = vec![active_proxy("a", 0.5), active_proxy("b", 5.0)];
        assert!(rotator
            .select(&proxies, &SelectionContext::default())
            .is_some());
    }

    #[test]
    fn test_adaptive_selects_and_learns() {
        let mut rotator = ProxyRotator::new(RotationStrategy::Adaptive);
        let proxies = vec![active_proxy("a", 0.5), active_proxy("b", 1.5)];
        let ctx = SelectionContext::default();

        for _ in 0..10 {
            let selected = rotator.select(&proxies, &ctx).unwrap();
            rotator.record_usage(&selected.key(), true, Some(0.3));
        }
        assert!(rotator.last_strategy.is_some());

        // 权重在调整后仍然是归一化的
        let total: f64 = rotator.strategy_weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }
}
