use tally_core::{MetricsWriter, ShortCode};
use tally_storage::MySqlMetricsWriter;
use tally_test_infra::mysql::{MySqlServer, MysqlConfig};

struct Fixture {
    _mysql: MySqlServer,
    writer: MySqlMetricsWriter,
}

impl Fixture {
    async fn start() -> Self {
        let mysql = MySqlServer::new(MysqlConfig::builder().build())
            .await
            .expect("start mysql");
        let pool = mysql.pool().await.expect("connect mysql");

        let writer = MySqlMetricsWriter::new(pool);
        writer.ensure_schema().await.expect("create schema");

        Self {
            _mysql: mysql,
            writer,
        }
    }
}

fn code(value: &str) -> ShortCode {
    ShortCode::new_unchecked(value)
}

#[tokio::test]
async fn increment_creates_then_accumulates() {
    let fixture = Fixture::start().await;
    let c = code("abc123");

    assert_eq!(fixture.writer.total_access_count(&c).await.unwrap(), None);
    assert_eq!(fixture.writer.increment_total(&c, 3).await.unwrap(), 3);
    assert_eq!(fixture.writer.increment_total(&c, 4).await.unwrap(), 7);
    assert_eq!(fixture.writer.total_access_count(&c).await.unwrap(), Some(7));
}

#[tokio::test]
async fn totals_are_kept_per_code() {
    let fixture = Fixture::start().await;

    fixture.writer.increment_total(&code("aaa"), 5).await.unwrap();
    fixture.writer.increment_total(&code("bbb"), 1).await.unwrap();

    assert_eq!(
        fixture.writer.total_access_count(&code("aaa")).await.unwrap(),
        Some(5)
    );
    assert_eq!(
        fixture.writer.total_access_count(&code("bbb")).await.unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn last_access_time_upserts_without_touching_total() {
    let fixture = Fixture::start().await;
    let c = code("abc123");

    fixture
        .writer
        .update_last_access_time(&c, 1_704_067_200_000)
        .await
        .unwrap();
    assert_eq!(fixture.writer.total_access_count(&c).await.unwrap(), Some(0));
    assert_eq!(
        fixture.writer.last_access_time(&c).await.unwrap(),
        Some(1_704_067_200_000)
    );

    fixture.writer.increment_total(&c, 2).await.unwrap();
    fixture
        .writer
        .update_last_access_time(&c, 1_704_067_260_000)
        .await
        .unwrap();
    assert_eq!(fixture.writer.total_access_count(&c).await.unwrap(), Some(2));
    assert_eq!(
        fixture.writer.last_access_time(&c).await.unwrap(),
        Some(1_704_067_260_000)
    );
}

#[tokio::test]
async fn ensure_schema_is_repeatable() {
    let fixture = Fixture::start().await;
    fixture.writer.ensure_schema().await.unwrap();
}
