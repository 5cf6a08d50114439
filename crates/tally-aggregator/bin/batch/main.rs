mod cli;
mod logging;

use std::time::Duration;

use crate::cli::{DurableBackendArg, CLI};
use clap::Parser;
use redis::aio::MultiplexedConnection;
use tally_aggregator::{
    parse_target_date, AggregationConfig, AggregationEngine, BatchType, CompositeMetricsWriter,
    CoordinatorConfig, InstanceId, JobCoordinator, RunOutcome,
};
use tally_cache::{RedisLock, RedisMetricsWriter, RedisStatsStore, RedisStoreConfig};
use tally_core::{today_utc, MetricsWriter};
use tally_storage::{InMemoryMetricsWriter, MySqlMetricsWriter};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = CLI::try_parse()?;
    logging::init_logging(config.log_format);

    let instance_id = config
        .instance_id
        .clone()
        .map(InstanceId::new)
        .unwrap_or_else(InstanceId::detect);

    info!(
        instance = %instance_id,
        durable_backend = %config.durable,
        "starting tally batch worker"
    );

    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = client.get_multiplexed_async_connection().await?;

    match config.durable {
        DurableBackendArg::InMemory => {
            warn!("durable totals are kept in memory and lost on exit");
            run(&config, instance_id, conn, InMemoryMetricsWriter::new()).await
        }
        DurableBackendArg::Mysql => {
            let mysql_dsn = config
                .mysql_dsn
                .as_deref()
                .ok_or("mysql dsn is required when durable backend is mysql")?;
            let durable = MySqlMetricsWriter::connect(mysql_dsn).await?;
            durable.ensure_schema().await?;
            run(&config, instance_id, conn, durable).await
        }
    }
}

async fn run<D: MetricsWriter>(
    config: &CLI,
    instance_id: InstanceId,
    conn: MultiplexedConnection,
    durable: D,
) -> Result<(), Box<dyn std::error::Error>> {
    let store_config = RedisStoreConfig::builder()
        .retention(Duration::from_secs(config.retention_secs))
        .build();

    let cache = RedisMetricsWriter::with_config(conn.clone(), &store_config);
    let store = RedisStatsStore::with_config(conn.clone(), store_config);
    let engine = AggregationEngine::new(
        store,
        CompositeMetricsWriter::new(durable, cache),
        AggregationConfig::builder()
            .instance_id(instance_id.clone())
            .build(),
    );
    let coordinator = JobCoordinator::new(
        RedisLock::new(conn),
        engine,
        CoordinatorConfig::builder()
            .instance_id(instance_id)
            .lock_ttl(Duration::from_secs(config.lock_ttl_secs))
            .build(),
    );

    if let Some(batch) = config.once {
        let date = parse_target_date(
            config.date.as_deref(),
            batch.default_target_date(today_utc()),
        );
        return match coordinator.run_if_unlocked(batch, date).await {
            RunOutcome::Failed => Err(format!("{batch} batch for {date} failed").into()),
            outcome => {
                info!(batch = %batch, date = %date, ?outcome, "single run finished");
                Ok(())
            }
        };
    }

    let mut hourly = interval(config.hourly_interval_secs);
    let mut daily = interval(config.daily_interval_secs);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = hourly.tick() => {
                coordinator.run_scheduled(BatchType::Hourly).await;
            }
            _ = daily.tick() => {
                coordinator.run_scheduled(BatchType::Daily).await;
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for shutdown signal");
                }
                info!("shutting down tally batch worker");
                return Ok(());
            }
        }
    }
}

fn interval(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
