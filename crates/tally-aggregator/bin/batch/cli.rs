use clap::{Parser, ValueEnum};
use std::fmt::{Display, Formatter};
use tally_aggregator::BatchType;

pub const REDIS_URL_ENV: &str = "TALLY_BATCH_REDIS_URL";
pub const DURABLE_BACKEND_ENV: &str = "TALLY_BATCH_DURABLE_BACKEND";
pub const MYSQL_DSN_ENV: &str = "TALLY_BATCH_MYSQL_DSN";
pub const INSTANCE_ID_ENV: &str = "TALLY_BATCH_INSTANCE_ID";
pub const LOCK_TTL_SECS_ENV: &str = "TALLY_BATCH_LOCK_TTL_SECS";
pub const RETENTION_SECS_ENV: &str = "TALLY_BATCH_RETENTION_SECS";
pub const HOURLY_INTERVAL_SECS_ENV: &str = "TALLY_BATCH_HOURLY_INTERVAL_SECS";
pub const DAILY_INTERVAL_SECS_ENV: &str = "TALLY_BATCH_DAILY_INTERVAL_SECS";
pub const LOG_FORMAT_ENV: &str = "TALLY_BATCH_LOG_FORMAT";

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_LOCK_TTL_SECS: u64 = 600;
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_HOURLY_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_DAILY_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DurableBackendArg {
    #[value(name = "in-memory")]
    InMemory,
    #[value(name = "mysql")]
    Mysql,
}

impl Display for DurableBackendArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DurableBackendArg::InMemory => write!(f, "in-memory"),
            DurableBackendArg::Mysql => write!(f, "mysql"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "tally-batch")]
pub struct CLI {
    #[arg(long, env = REDIS_URL_ENV, default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    #[arg(
        long,
        env = DURABLE_BACKEND_ENV,
        value_enum,
        default_value_t = DurableBackendArg::InMemory
    )]
    pub durable: DurableBackendArg,

    #[arg(long, env = MYSQL_DSN_ENV, required_if_eq("durable", "mysql"))]
    pub mysql_dsn: Option<String>,

    /// Lock owner name; defaults to the hostname plus a random suffix.
    #[arg(long, env = INSTANCE_ID_ENV)]
    pub instance_id: Option<String>,

    #[arg(long, env = LOCK_TTL_SECS_ENV, default_value_t = DEFAULT_LOCK_TTL_SECS)]
    pub lock_ttl_secs: u64,

    #[arg(long, env = RETENTION_SECS_ENV, default_value_t = DEFAULT_RETENTION_SECS)]
    pub retention_secs: u64,

    #[arg(
        long,
        env = HOURLY_INTERVAL_SECS_ENV,
        default_value_t = DEFAULT_HOURLY_INTERVAL_SECS
    )]
    pub hourly_interval_secs: u64,

    #[arg(
        long,
        env = DAILY_INTERVAL_SECS_ENV,
        default_value_t = DEFAULT_DAILY_INTERVAL_SECS
    )]
    pub daily_interval_secs: u64,

    #[arg(long, env = LOG_FORMAT_ENV, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,

    /// Run a single batch and exit instead of scheduling.
    #[arg(long)]
    pub once: Option<BatchType>,

    /// Target date for `--once`: YYYY-MM-DD, YYYY/MM/DD or YYYYMMDD.
    #[arg(long, requires = "once")]
    pub date: Option<String>,
}
