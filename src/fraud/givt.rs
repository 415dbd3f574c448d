//! General invalid traffic: free, local checks that run before any paid scoring.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::FraudConfig;
use crate::keystore::KeyStore;
use crate::models::IvtReason;

/// Lowercase substrings of automation and crawler user agents.
const BOT_USER_AGENT_PATTERNS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "slurp",
    "headlesschrome",
    "phantomjs",
    "selenium",
    "puppeteer",
    "playwright",
    "curl/",
    "wget/",
    "python-requests",
    "python-urllib",
    "aiohttp",
    "go-http-client",
    "java/",
    "okhttp",
    "scrapy",
    "libwww-perl",
    "apache-httpclient",
    "node-fetch",
];

/// Published ranges of large cloud and hosting providers.
const DATACENTER_RANGES: &[&str] = &[
    // AWS
    "3.0.0.0/9",
    "52.0.0.0/10",
    "54.64.0.0/11",
    // Google Cloud
    "34.64.0.0/10",
    "35.184.0.0/13",
    // Azure
    "20.33.0.0/16",
    "40.64.0.0/10",
    // DigitalOcean
    "104.131.0.0/16",
    "138.68.0.0/16",
    "159.65.0.0/16",
    // OVH, Hetzner, Linode
    "51.68.0.0/16",
    "95.216.0.0/15",
    "45.79.0.0/16",
];

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.trim().split_once('/')?;
        let network: IpAddr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix <= max).then_some(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

pub fn is_bot_user_agent(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    BOT_USER_AGENT_PATTERNS.iter().any(|p| ua.contains(p))
}

pub struct GivtFilter {
    keystore: Arc<dyn KeyStore>,
    datacenter_ranges: Vec<Cidr>,
    max_events_per_minute: i64,
}

impl GivtFilter {
    pub fn new(keystore: Arc<dyn KeyStore>, config: &FraudConfig) -> Self {
        let mut datacenter_ranges: Vec<Cidr> =
            DATACENTER_RANGES.iter().filter_map(|s| Cidr::parse(s)).collect();
        for extra in &config.extra_datacenter_ranges {
            match Cidr::parse(extra) {
                Some(cidr) => datacenter_ranges.push(cidr),
                None => warn!("Ignoring invalid datacenter range: {}", extra),
            }
        }

        Self {
            keystore,
            datacenter_ranges,
            max_events_per_minute: config.max_events_per_ip_per_minute,
        }
    }

    pub fn is_datacenter_ip(&self, ip: IpAddr) -> bool {
        self.datacenter_ranges.iter().any(|c| c.contains(ip))
    }

    /// First matching reason, checked cheapest first. The rate counter only
    /// counts events that passed the static checks.
    pub async fn check(
        &self,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<IvtReason>> {
        if user_agent.is_some_and(is_bot_user_agent) {
            return Ok(Some(IvtReason::BotUserAgent));
        }

        let Some(ip) = ip else {
            return Ok(None);
        };
        if self.is_datacenter_ip(ip) {
            return Ok(Some(IvtReason::DatacenterIp));
        }

        let key = format!("givt:rate:{}:{}", ip, now.timestamp() / 60);
        let count = self
            .keystore
            .incr_by(&key, 1, Some(Duration::from_secs(120)))
            .await?;
        if count > self.max_events_per_minute {
            return Ok(Some(IvtReason::RateExceeded));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;

    fn filter(max_per_minute: i64) -> GivtFilter {
        let config = FraudConfig {
            max_events_per_ip_per_minute: max_per_minute,
            extra_datacenter_ranges: vec!["198.51.100.0/24".to_string(), "nonsense".to_string()],
            ..FraudConfig::default()
        };
        GivtFilter::new(Arc::new(MemoryKeyStore::new()), &config)
    }

    #[test]
    fn test_cidr_contains() {
        let net = Cidr::parse("10.1.0.0/16").unwrap();
        assert!(net.contains("10.1.255.3".parse().unwrap()));
        assert!(!net.contains("10.2.0.1".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));

        let all = Cidr::parse("0.0.0.0/0").unwrap();
        assert!(all.contains("8.8.8.8".parse().unwrap()));

        let v6 = Cidr::parse("2001:db8::/32").unwrap();
        assert!(v6.contains("2001:db8:1::7".parse().unwrap()));
        assert!(Cidr::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_bot_user_agents() {
        assert!(is_bot_user_agent(
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)"
        ));
        assert!(is_bot_user_agent("curl/8.4.0"));
        assert!(is_bot_user_agent("Mozilla/5.0 HeadlessChrome/120.0"));
        assert!(!is_bot_user_agent(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15"
        ));
    }

    #[tokio::test]
    async fn test_reasons_in_order() {
        let givt = filter(120);
        let now = Utc::now();

        let dc: IpAddr = "3.5.140.2".parse().unwrap();
        assert_eq!(
            givt.check(Some(dc), Some("Googlebot"), now).await.unwrap(),
            Some(IvtReason::BotUserAgent)
        );
        assert_eq!(
            givt.check(Some(dc), Some("Mozilla/5.0"), now).await.unwrap(),
            Some(IvtReason::DatacenterIp)
        );
        let extra: IpAddr = "198.51.100.20".parse().unwrap();
        assert_eq!(
            givt.check(Some(extra), None, now).await.unwrap(),
            Some(IvtReason::DatacenterIp)
        );
        let residential: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(givt.check(Some(residential), None, now).await.unwrap(), None);
        assert_eq!(givt.check(None, Some("Mozilla/5.0"), now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rate_heuristic_trips_after_limit() {
        let givt = filter(3);
        let now = Utc::now();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        for _ in 0..3 {
            assert_eq!(givt.check(Some(ip), None, now).await.unwrap(), None);
        }
        assert_eq!(
            givt.check(Some(ip), None, now).await.unwrap(),
            Some(IvtReason::RateExceeded)
        );

        let other: IpAddr = "203.0.113.10".parse().unwrap();
        assert_eq!(givt.check(Some(other), None, now).await.unwrap(), None);
    }
}
