use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.var, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Process settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    pub data_dir: PathBuf,
    pub timezone: Tz,
    pub cron_secret: Option<String>,
    pub sweep_every: Option<Duration>,
    pub compact_threshold: u64,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub events_file: Option<PathBuf>,
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError {
                var,
                message: format!("invalid value '{raw}': {e}"),
            })
        }
        _ => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source; unset or blank keys take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let timezone = match lookup("LESSOND_STUDIO_TZ") {
            Some(name) if !name.trim().is_empty() => {
                name.trim().parse::<Tz>().map_err(|e| ConfigError {
                    var: "LESSOND_STUDIO_TZ",
                    message: e.to_string(),
                })?
            }
            _ => Tz::UTC,
        };
        let sweep_every = match parsed::<u64>(&lookup, "LESSOND_SWEEP_INTERVAL_SECS")? {
            Some(0) => {
                return Err(ConfigError {
                    var: "LESSOND_SWEEP_INTERVAL_SECS",
                    message: "must be positive".into(),
                });
            }
            other => other.map(Duration::from_secs),
        };
        let max_connections = parsed(&lookup, "LESSOND_MAX_CONNECTIONS")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(ConfigError {
                var: "LESSOND_MAX_CONNECTIONS",
                message: "must be positive".into(),
            });
        }

        Ok(Self {
            bind: parsed(&lookup, "LESSOND_BIND")?.unwrap_or(IpAddr::from([0, 0, 0, 0])),
            port: parsed(&lookup, "LESSOND_PORT")?.unwrap_or(8080),
            data_dir: parsed(&lookup, "LESSOND_DATA_DIR")?.unwrap_or_else(|| PathBuf::from("./data")),
            timezone,
            cron_secret: lookup("LESSOND_CRON_SECRET").filter(|s| !s.is_empty()),
            sweep_every,
            compact_threshold: parsed(&lookup, "LESSOND_COMPACT_THRESHOLD")?.unwrap_or(1000),
            max_connections,
            metrics_port: parsed(&lookup, "LESSOND_METRICS_PORT")?,
            events_file: parsed(&lookup, "LESSOND_EVENTS_FILE")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.bind, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.timezone, Tz::UTC);
        assert_eq!(config.cron_secret, None);
        assert_eq!(config.sweep_every, None);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.events_file, None);
    }

    #[test]
    fn overrides() {
        let config = from_pairs(&[
            ("LESSOND_BIND", "127.0.0.1"),
            ("LESSOND_PORT", "9000"),
            ("LESSOND_STUDIO_TZ", "America/New_York"),
            ("LESSOND_CRON_SECRET", "s3cret"),
            ("LESSOND_SWEEP_INTERVAL_SECS", "300"),
            ("LESSOND_METRICS_PORT", "9100"),
            ("LESSOND_EVENTS_FILE", "/etc/lessond/events.json"),
        ])
        .unwrap();
        assert_eq!(config.bind, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.port, 9000);
        assert_eq!(config.timezone, chrono_tz::America::New_York);
        assert_eq!(config.cron_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.sweep_every, Some(Duration::from_secs(300)));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(
            config.events_file,
            Some(PathBuf::from("/etc/lessond/events.json"))
        );
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = from_pairs(&[("LESSOND_PORT", "eighty")]).unwrap_err();
        assert_eq!(err.var, "LESSOND_PORT");
        let err = from_pairs(&[("LESSOND_STUDIO_TZ", "Mars/Olympus")]).unwrap_err();
        assert_eq!(err.var, "LESSOND_STUDIO_TZ");
        let err = from_pairs(&[("LESSOND_SWEEP_INTERVAL_SECS", "0")]).unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn blank_secret_is_unset() {
        let config = from_pairs(&[("LESSOND_CRON_SECRET", "")]).unwrap();
        assert_eq!(config.cron_secret, None);
    }
}
