// Runs against a live Postgres only when IEH_TEST_DATABASE_URL is set.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ieh_storage::sheets::SHEET_COLUMNS;
use ieh_storage::{InMemorySheet, PostStorage, RelationalSink, SheetBackend, SheetsSink};
use ieh_sync::{MigrationController, MigrationSummary};

#[tokio::test]
async fn migrating_sheet_rows_twice_moves_each_once() {
    let Ok(url) = std::env::var("IEH_TEST_DATABASE_URL") else {
        eprintln!("IEH_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let relational = RelationalSink::connect(&url, Duration::from_secs(5)).await.expect("connect");

    let prefix = format!(
        "https://www.instagram.com/p/mig-{}-",
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    let mut rows = vec![SHEET_COLUMNS.iter().map(|c| c.to_string()).collect::<Vec<_>>()];
    rows.extend((0..5).map(|i| {
        vec![
            format!("{prefix}{i}/"),
            format!("row {i}"),
            (i * 10).to_string(),
            i.to_string(),
            format!("2026-01-0{}T08:00:00Z", i + 1),
            "image".to_string(),
            "2026-02-01T00:00:00Z".to_string(),
        ]
    }));
    let sheet = Arc::new(InMemorySheet::with_rows(rows));
    let sheets = SheetsSink::new(sheet.clone() as Arc<dyn SheetBackend>);
    let controller = MigrationController::default();

    let first = controller.migrate(&sheets, &relational).await.expect("first run");
    assert_eq!(first, MigrationSummary { migrated: 5, skipped: 0 });
    let second = controller.migrate(&sheets, &relational).await.expect("second run");
    assert_eq!(second, MigrationSummary { migrated: 0, skipped: 5 });

    for i in 0..5 {
        assert!(relational.exists(&format!("{prefix}{i}/")).await.unwrap());
    }
    assert_eq!(sheet.rows().await.len(), 6);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instagram_posts WHERE source_url LIKE $1")
        .bind(format!("{prefix}%"))
        .fetch_one(relational.pool())
        .await
        .unwrap();
    assert_eq!(count, 5);

    sqlx::query("DELETE FROM instagram_posts WHERE source_url LIKE $1")
        .bind(format!("{prefix}%"))
        .execute(relational.pool())
        .await
        .unwrap();
    relational.close().await;
}
