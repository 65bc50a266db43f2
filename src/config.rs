//! Server configuration: defaults, then environment, then command line.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_BIND: &str = "127.0.0.1:8765";
pub const DEFAULT_TICK_MS: u64 = 120;
pub const DEFAULT_GRID_RESEND_MS: u64 = 1500;
pub const DEFAULT_ACCOUNTS_PATH: &str = "data/accounts.json";
pub const DEFAULT_MAX_QUEUE: usize = 10_000;

pub const USAGE: &str = "tablesync-server\n\n\
USAGE:\n  tablesync-server [--bind HOST:PORT] [--tick-ms N] [--grid-resend-ms N]\n\
                   [--accounts PATH] [--max-queue N] [--seed N] [--encounter PATH]\n\n\
ENV:\n  TABLESYNC_BIND            default 127.0.0.1:8765\n\
  TABLESYNC_TICK_MS         default 120\n\
  TABLESYNC_GRID_RESEND_MS  default 1500\n\
  TABLESYNC_ACCOUNTS        default data/accounts.json\n\
  TABLESYNC_MAX_QUEUE       default 10000\n\
  TABLESYNC_SEED            unset: random dice\n\
  TABLESYNC_ENCOUNTER       unset: empty 20x20 map\n\n\
DESK (stdin):\n  start | next | end | remove <id> | hp <id> <n>\n\
  condition <id> <name> [rounds] | clear <id> <name>\n\
  add <combatant json> | grid <grid json>\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("help requested")]
    Help,

    #[error("missing value for {0}")]
    MissingValue(String),

    #[error("bad value {value:?} for {name}")]
    BadValue { name: String, value: String },

    #[error("unknown argument {0:?}")]
    UnknownArgument(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub tick: Duration,
    pub grid_resend: Duration,
    pub accounts_path: PathBuf,
    /// Pending inbound commands above which new ones are dropped.
    pub max_queue: usize,
    pub seed: Option<u64>,
    pub encounter: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8765)),
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            grid_resend: Duration::from_millis(DEFAULT_GRID_RESEND_MS),
            accounts_path: PathBuf::from(DEFAULT_ACCOUNTS_PATH),
            max_queue: DEFAULT_MAX_QUEUE,
            seed: None,
            encounter: None,
        }
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

impl ServerConfig {
    /// Resolve from the process environment and arguments.
    pub fn from_env_and_args() -> Result<Self, ConfigError> {
        Self::resolve(|k| std::env::var(k).ok(), std::env::args().skip(1))
    }

    /// Resolve from an environment lookup and an argument list (without
    /// the program name).
    pub fn resolve(
        env: impl Fn(&str) -> Option<String>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        for key in [
            "TABLESYNC_BIND",
            "TABLESYNC_TICK_MS",
            "TABLESYNC_GRID_RESEND_MS",
            "TABLESYNC_ACCOUNTS",
            "TABLESYNC_MAX_QUEUE",
            "TABLESYNC_SEED",
            "TABLESYNC_ENCOUNTER",
        ] {
            if let Some(value) = env(key).filter(|v| !v.trim().is_empty()) {
                cfg.set(key, &value)?;
            }
        }

        let mut it = args.into_iter();
        while let Some(arg) = it.next() {
            let key = match arg.as_str() {
                "-h" | "--help" => return Err(ConfigError::Help),
                "--bind" => "TABLESYNC_BIND",
                "--tick-ms" => "TABLESYNC_TICK_MS",
                "--grid-resend-ms" => "TABLESYNC_GRID_RESEND_MS",
                "--accounts" => "TABLESYNC_ACCOUNTS",
                "--max-queue" => "TABLESYNC_MAX_QUEUE",
                "--seed" => "TABLESYNC_SEED",
                "--encounter" => "TABLESYNC_ENCOUNTER",
                _ => return Err(ConfigError::UnknownArgument(arg.clone())),
            };
            let value = it.next().ok_or_else(|| ConfigError::MissingValue(arg.clone()))?;
            cfg.set(key, &value)?;
        }

        Ok(cfg)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "TABLESYNC_BIND" => self.bind = parse(key, value)?,
            "TABLESYNC_TICK_MS" => {
                let ms: u64 = parse(key, value)?;
                if ms == 0 {
                    return Err(ConfigError::BadValue {
                        name: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.tick = Duration::from_millis(ms);
            }
            "TABLESYNC_GRID_RESEND_MS" => self.grid_resend = Duration::from_millis(parse(key, value)?),
            "TABLESYNC_ACCOUNTS" => self.accounts_path = PathBuf::from(value),
            "TABLESYNC_MAX_QUEUE" => self.max_queue = parse(key, value)?,
            "TABLESYNC_SEED" => self.seed = Some(parse(key, value)?),
            "TABLESYNC_ENCOUNTER" => self.encounter = Some(PathBuf::from(value)),
            _ => return Err(ConfigError::UnknownArgument(key.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::resolve(|_| None, Vec::new()).unwrap();
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.bind.to_string(), DEFAULT_BIND);
    }

    #[test]
    fn test_args_override_env() {
        let env = |k: &str| match k {
            "TABLESYNC_BIND" => Some("0.0.0.0:9000".to_string()),
            "TABLESYNC_SEED" => Some("42".to_string()),
            _ => None,
        };
        let cfg = ServerConfig::resolve(env, args(&["--bind", "127.0.0.1:9100", "--tick-ms", "100"]))
            .unwrap();
        assert_eq!(cfg.bind.to_string(), "127.0.0.1:9100");
        assert_eq!(cfg.tick, Duration::from_millis(100));
        assert_eq!(cfg.seed, Some(42));
    }

    #[test]
    fn test_bad_input() {
        assert_eq!(
            ServerConfig::resolve(|_| None, args(&["--tick-ms"])),
            Err(ConfigError::MissingValue("--tick-ms".to_string()))
        );
        assert_eq!(
            ServerConfig::resolve(|_| None, args(&["--tick-ms", "0"])),
            Err(ConfigError::BadValue {
                name: "TABLESYNC_TICK_MS".to_string(),
                value: "0".to_string()
            })
        );
        assert_eq!(
            ServerConfig::resolve(|_| None, args(&["--verbose"])),
            Err(ConfigError::UnknownArgument("--verbose".to_string()))
        );
        assert_eq!(ServerConfig::resolve(|_| None, args(&["-h"])), Err(ConfigError::Help));
    }
}
