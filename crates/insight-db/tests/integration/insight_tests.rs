use insight_core::models::{InsightRecord, InsightSource};
use insight_core::traits::InsightStore;

use crate::integration::common::setup_test_db;

fn record(id: &str, timestamp: i64) -> InsightRecord {
    InsightRecord {
        id: id.into(),
        token_id: "btc".into(),
        timestamp,
        title: "Foo".into(),
        content: "Bar".into(),
        source_count: 1,
        sources: vec![InsightSource {
            url: "https://news.example.com/a".into(),
            title: "Article".into(),
        }],
    }
}

#[tokio::test]
async fn upsert_and_read_back() {
    let (db, _container) = setup_test_db().await;

    assert!(!db.insight_exists("btc_1").await.unwrap());
    db.upsert_insight(&record("btc_1", 100)).await.unwrap();
    assert!(db.insight_exists("btc_1").await.unwrap());

    let latest = db.latest_insights(10, 0).await.unwrap();
    assert_eq!(latest, vec![record("btc_1", 100)]);
}

#[tokio::test]
async fn upsert_is_idempotent_and_overwrites() {
    let (db, _container) = setup_test_db().await;

    db.upsert_insight(&record("btc_1", 100)).await.unwrap();
    db.upsert_insight(&record("btc_1", 100)).await.unwrap();

    let mut changed = record("btc_1", 100);
    changed.title = "Updated".into();
    changed.sources.clear();
    db.upsert_insight(&changed).await.unwrap();

    assert_eq!(db.insight_repo().count().await.unwrap(), 1);
    assert_eq!(db.latest_insights(10, 0).await.unwrap(), vec![changed]);
}

#[tokio::test]
async fn latest_is_newest_first_with_paging() {
    let (db, _container) = setup_test_db().await;
    for (id, ts) in [("btc_a", 100), ("btc_b", 300), ("btc_c", 200)] {
        db.upsert_insight(&record(id, ts)).await.unwrap();
    }

    let ids = |records: Vec<InsightRecord>| records.into_iter().map(|r| r.id).collect::<Vec<_>>();
    assert_eq!(
        ids(db.latest_insights(10, 0).await.unwrap()),
        vec!["btc_b", "btc_c", "btc_a"]
    );
    assert_eq!(ids(db.latest_insights(1, 1).await.unwrap()), vec!["btc_c"]);

    // Oversized paging values clamp instead of wrapping negative.
    assert_eq!(db.latest_insights(usize::MAX, 0).await.unwrap().len(), 3);
    assert!(db.latest_insights(10, usize::MAX).await.unwrap().is_empty());
}
