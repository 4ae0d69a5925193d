//! Server configuration from the environment
//!
//! | Variable | Default |
//! |----------|---------|
//! | `PORT` | 8080 |
//! | `SCHEDULE_LEAD_MS` | 750 |
//! | `SPATIAL_TICK_MS` | 100 |
//! | `SPATIAL_LEAD_MS` | 100 |
//! | `PING_INTERVAL_SECS` | 5 |
//! | `ALLOWED_ORIGINS` | any (comma separated list) |

use std::str::FromStr;
use std::time::Duration;

use crate::spatial::SpatialTiming;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Lead between receiving PLAY/PAUSE and executing it everywhere
    pub schedule_lead: Duration,
    pub spatial: SpatialTiming,
    /// Interval of the WebSocket pings used to measure member RTT
    pub ping_interval: Duration,
    /// CORS origins; empty allows any
    pub allowed_origins: Vec<String>,
    pub use_dashboard: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            schedule_lead: Duration::from_millis(750),
            spatial: SpatialTiming::default(),
            ping_interval: Duration::from_secs(5),
            allowed_origins: Vec::new(),
            use_dashboard: true,
        }
    }
}

impl ServerConfig {
    pub fn from_env(args: &[String]) -> Self {
        Self::from_lookup(args, |name| std::env::var(name).ok())
    }

    fn from_lookup(args: &[String], lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            Duration::from_millis(parse_or(lookup(name), default.as_millis() as u64))
        };

        Self {
            port: parse_or(lookup("PORT"), defaults.port),
            schedule_lead: millis("SCHEDULE_LEAD_MS", defaults.schedule_lead),
            spatial: SpatialTiming {
                // interval() panics on a zero period
                tick: millis("SPATIAL_TICK_MS", defaults.spatial.tick).max(Duration::from_millis(1)),
                lead: millis("SPATIAL_LEAD_MS", defaults.spatial.lead),
            },
            ping_interval: Duration::from_secs(
                parse_or(lookup("PING_INTERVAL_SECS"), defaults.ping_interval.as_secs()).max(1),
            ),
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            use_dashboard: !args.iter().any(|arg| arg == "--no-dashboard"),
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)], args: &[&str]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        ServerConfig::from_lookup(&args, |name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[], &["surround-server"]);
        assert_eq!(c.port, 8080);
        assert_eq!(c.schedule_lead, Duration::from_millis(750));
        assert_eq!(c.spatial.tick, Duration::from_millis(100));
        assert_eq!(c.spatial.lead, Duration::from_millis(100));
        assert_eq!(c.ping_interval, Duration::from_secs(5));
        assert!(c.allowed_origins.is_empty());
        assert!(c.use_dashboard);
    }

    #[test]
    fn test_overrides() {
        let c = config(
            &[
                ("PORT", "9000"),
                ("SCHEDULE_LEAD_MS", " 1200 "),
                ("SPATIAL_TICK_MS", "0"),
                ("ALLOWED_ORIGINS", "http://localhost:3000, https://example.com,"),
            ],
            &["surround-server", "--no-dashboard"],
        );
        assert_eq!(c.port, 9000);
        assert_eq!(c.schedule_lead, Duration::from_millis(1200));
        assert_eq!(c.spatial.tick, Duration::from_millis(1));
        assert_eq!(
            c.allowed_origins,
            vec!["http://localhost:3000".to_string(), "https://example.com".to_string()]
        );
        assert!(!c.use_dashboard);
    }

    #[test]
    fn test_garbage_falls_back() {
        let c = config(&[("PORT", "eighty"), ("PING_INTERVAL_SECS", "-3")], &[]);
        assert_eq!(c.port, 8080);
        assert_eq!(c.ping_interval, Duration::from_secs(5));
    }
}
