//! Startup configuration, loaded once from the environment (and `.env`).
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::errors::ConsumerError;
use crate::ingest::SettlementMode;
use crate::settle::{DeliveryPolicy, LockBudget};

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub dead_letter_stream: String,
    /// Stream that receives Error Sink alerts; `None` keeps alerts in the log.
    pub alert_stream: Option<String>,
    pub auto_complete: bool,
    pub max_auto_lock_renew: Duration,
    pub lock_duration: Duration,
    pub lock_margin: Duration,
    /// Deliveries allowed before a failing message is dead-lettered.
    pub max_delivery_count: Option<u32>,
    pub concurrency: usize,
}

impl Config {
    pub fn settlement_mode(&self) -> SettlementMode {
        if self.auto_complete {
            SettlementMode::AutoComplete
        } else {
            SettlementMode::ManualComplete
        }
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_delivery_count: self.max_delivery_count,
        }
    }

    pub fn lock_budget(&self) -> LockBudget {
        LockBudget {
            max_auto_lock_renew: self.max_auto_lock_renew,
            margin: self.lock_margin,
        }
    }
}

pub fn load_config() -> Result<Config, ConsumerError> {
    dotenv().ok();
    config_from(|key| env::var(key).ok())
}

/// Build a [`Config`] from an arbitrary key lookup (the process env in prod).
pub fn config_from<F>(lookup: F) -> Result<Config, ConsumerError>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| {
        lookup(key).ok_or_else(|| ConsumerError::Configuration(format!("{key} is not set")))
    };

    let redis_url = required("REDIS_URL")?;
    let stream = required("QUEUE_STREAM")?;
    let auto_complete = parse_bool("AUTO_COMPLETE", &required("AUTO_COMPLETE")?)?;

    let group = lookup("CONSUMER_GROUP").unwrap_or_else(|| "consumers".into());
    let consumer = lookup("CONSUMER_NAME").unwrap_or_else(|| "consumer-1".into());
    let dead_letter_stream =
        lookup("DEAD_LETTER_STREAM").unwrap_or_else(|| format!("{stream}:dlq"));
    let alert_stream = lookup("ALERT_STREAM").filter(|s| !s.is_empty());

    let duration_or = |key: &str, default: Duration| match lookup(key) {
        Some(v) => parse_duration(&v)
            .map_err(|e| ConsumerError::Configuration(format!("{key}: {e}"))),
        None => Ok(default),
    };
    let max_auto_lock_renew = duration_or("MAX_AUTO_LOCK_RENEW_DURATION", Duration::ZERO)?;
    let lock_duration = duration_or("LOCK_DURATION", Duration::from_secs(60))?;
    let lock_margin = duration_or("LOCK_SAFETY_MARGIN", Duration::from_secs(1))?;
    if lock_duration.is_zero() {
        return Err(ConsumerError::Configuration(
            "LOCK_DURATION must be positive".into(),
        ));
    }

    let max_delivery_count = match lookup("MAX_DELIVERY_COUNT") {
        Some(v) => {
            let n: u32 = v.trim().parse().map_err(|_| {
                ConsumerError::Configuration(format!("MAX_DELIVERY_COUNT: not a count: {v}"))
            })?;
            (n > 0).then_some(n)
        }
        None => None,
    };

    let concurrency = match lookup("MAX_CONCURRENT_CALLS") {
        Some(v) => v.trim().parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
            ConsumerError::Configuration(format!("MAX_CONCURRENT_CALLS: not a positive count: {v}"))
        })?,
        None => std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(8),
    };

    Ok(Config {
        redis_url,
        stream,
        group,
        consumer,
        dead_letter_stream,
        alert_stream,
        auto_complete,
        max_auto_lock_renew,
        lock_duration,
        lock_margin,
        max_delivery_count,
        concurrency,
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConsumerError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConsumerError::Configuration(format!(
            "{key}: expected a boolean, got {other:?}"
        ))),
    }
}

/// Parse `PT1M30S`-style ISO-8601 durations or a bare number of seconds.
///
/// Only the time part (`H`, `M`, `S`) is supported; seconds may carry a
/// fractional part (`PT0.5S`).
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let upper = s.to_ascii_uppercase();
    let body = upper
        .strip_prefix("PT")
        .ok_or_else(|| format!("unsupported duration {raw:?}"))?;
    if body.is_empty() {
        return Err(format!("duration {raw:?} has no components"));
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    for c in body.chars() {
        match c {
            '0'..='9' | '.' => num.push(c),
            'H' | 'M' | 'S' => {
                let value: f64 = num
                    .parse()
                    .map_err(|_| format!("bad number before '{c}' in {raw:?}"))?;
                let unit = match c {
                    'H' => 3600.0,
                    'M' => 60.0,
                    _ => 1.0,
                };
                total = Duration::try_from_secs_f64(value * unit)
                    .ok()
                    .and_then(|part| total.checked_add(part))
                    .ok_or_else(|| format!("duration {raw:?} is out of range"))?;
                num.clear();
            }
            _ => return Err(format!("unexpected '{c}' in {raw:?}")),
        }
    }
    if !num.is_empty() {
        return Err(format!("trailing number without unit in {raw:?}"));
    }
    Ok(total)
}
