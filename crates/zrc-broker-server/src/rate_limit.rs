use dashmap::DashMap;
use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub agent_poll_limit: u32,
    pub signal_limit: u32,
    pub operator_limit: u32,
    pub window_secs: u64,
    pub allowlist: Vec<IpAddr>,
    pub blocklist: Vec<IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            agent_poll_limit: 60,
            signal_limit: 600,
            operator_limit: 60,
            window_secs: 60,
            allowlist: Vec::new(),
            blocklist: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be > 0");
        }
        if self.agent_poll_limit == 0 || self.signal_limit == 0 || self.operator_limit == 0 {
            anyhow::bail!("rate limits must be > 0");
        }
        Ok(())
    }
}

/// Which budget a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    AgentPoll,
    Signal,
    Operator,
}

impl RequestClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestClass::AgentPoll => "agent_poll",
            RequestClass::Signal => "signal",
            RequestClass::Operator => "operator",
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
    limit: u32,
    window: Duration,
}

impl TokenBucket {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            tokens: limit,
            last_refill: Instant::now(),
            limit,
            window,
        }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);

        if elapsed >= self.window {
            self.tokens = self.limit;
            self.last_refill = now;
        } else {
            // Proportional refill; the clock only advances once a whole token is earned.
            let refill =
                (self.limit as f64 * elapsed.as_secs_f64() / self.window.as_secs_f64()) as u32;
            if refill > 0 {
                self.tokens = (self.tokens + refill).min(self.limit);
                self.last_refill = now;
            }
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Seconds until at least one token is available again.
    fn retry_after(&self) -> u64 {
        let per_token = self.window.as_secs_f64() / self.limit.max(1) as f64;
        let waited = Instant::now().duration_since(self.last_refill).as_secs_f64();
        (per_token - waited).ceil().max(1.0) as u64
    }
}

/// Per-client-IP token buckets, one per request class.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<(IpAddr, RequestClass), Arc<Mutex<TokenBucket>>>>,
    config: RateLimitConfig,
    allowlist: Arc<DashMap<IpAddr, ()>>,
    blocklist: Arc<DashMap<IpAddr, ()>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let limiter = Self {
            buckets: Arc::new(DashMap::new()),
            allowlist: Arc::new(DashMap::new()),
            blocklist: Arc::new(DashMap::new()),
            config,
        };
        for ip in &limiter.config.allowlist {
            limiter.add_to_allowlist(*ip);
        }
        for ip in &limiter.config.blocklist {
            limiter.add_to_blocklist(*ip);
        }
        limiter
    }

    fn limit_for(&self, class: RequestClass) -> u32 {
        match class {
            RequestClass::AgentPoll => self.config.agent_poll_limit,
            RequestClass::Signal => self.config.signal_limit,
            RequestClass::Operator => self.config.operator_limit,
        }
    }

    /// `Err(retry_after_secs)` when the client is over budget.
    pub async fn check(&self, ip: IpAddr, class: RequestClass) -> Result<(), u64> {
        if self.blocklist.contains_key(&ip) {
            return Err(self.config.window_secs);
        }

        if self.allowlist.contains_key(&ip) {
            return Ok(());
        }

        let window = Duration::from_secs(self.config.window_secs);
        let limit = self.limit_for(class);
        let bucket = self
            .buckets
            .entry((ip, class))
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(limit, window))))
            .clone();

        let mut bucket = bucket.lock().await;
        if bucket.check() {
            Ok(())
        } else {
            Err(bucket.retry_after())
        }
    }

    /// Drop buckets that have been idle for a full window.
    pub fn prune_idle(&self) -> usize {
        let window = Duration::from_secs(self.config.window_secs);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| match bucket.try_lock() {
            Ok(b) => b.last_refill.elapsed() < window,
            Err(_) => true,
        });
        before - self.buckets.len()
    }

    pub fn add_to_allowlist(&self, ip: IpAddr) {
        self.allowlist.insert(ip, ());
    }

    pub fn add_to_blocklist(&self, ip: IpAddr) {
        self.blocklist.insert(ip, ());
    }

    pub fn remove_from_allowlist(&self, ip: IpAddr) {
        self.allowlist.remove(&ip);
    }

    pub fn remove_from_blocklist(&self, ip: IpAddr) {
        self.blocklist.remove(&ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            agent_poll_limit: limit,
            signal_limit: limit,
            operator_limit: limit,
            window_secs: 60,
            ..RateLimitConfig::default()
        })
    }

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    #[tokio::test]
    async fn test_limit_enforced_with_retry_after() {
        let limiter = limiter(3);
        for _ in 0..3 {
            assert!(limiter.check(IP, RequestClass::AgentPoll).await.is_ok());
        }
        let retry = limiter.check(IP, RequestClass::AgentPoll).await.unwrap_err();
        assert!(retry >= 1);
    }

    #[tokio::test]
    async fn test_classes_and_clients_are_independent() {
        let limiter = limiter(1);
        assert!(limiter.check(IP, RequestClass::AgentPoll).await.is_ok());
        assert!(limiter.check(IP, RequestClass::AgentPoll).await.is_err());

        assert!(limiter.check(IP, RequestClass::Signal).await.is_ok());
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(limiter.check(other, RequestClass::AgentPoll).await.is_ok());
    }

    #[tokio::test]
    async fn test_allow_and_block_lists() {
        let limiter = limiter(1);
        limiter.add_to_allowlist(IP);
        for _ in 0..10 {
            assert!(limiter.check(IP, RequestClass::Operator).await.is_ok());
        }
        limiter.remove_from_allowlist(IP);
        limiter.add_to_blocklist(IP);
        assert_eq!(limiter.check(IP, RequestClass::Operator).await, Err(60));

        limiter.remove_from_blocklist(IP);
        assert!(limiter.check(IP, RequestClass::Operator).await.is_ok());
        assert!(limiter.check(IP, RequestClass::Operator).await.is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimitConfig::default().validate().is_ok());
        let bad = RateLimitConfig {
            window_secs: 0,
            ..RateLimitConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
