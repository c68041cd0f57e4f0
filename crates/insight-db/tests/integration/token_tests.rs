use chrono::{Duration, Utc};
use insight_core::models::NewToken;
use insight_core::traits::TokenRegistry;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn create_and_list_tokens() {
    let (db, _container) = setup_test_db().await;

    let created = db
        .create_token(&NewToken::new("bitcoin", "Bitcoin", 60))
        .await
        .unwrap();
    assert_eq!(created.id, "bitcoin");
    assert!(created.enabled);
    assert!(created.last_scraped_at.is_none());

    db.create_token(&NewToken::new("aave", "Aave", 30))
        .await
        .unwrap();

    let ids: Vec<_> = db
        .list_tokens()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec!["aave", "bitcoin"]);
}

#[tokio::test]
async fn duplicate_token_is_rejected() {
    let (db, _container) = setup_test_db().await;
    db.create_token(&NewToken::new("eth", "Ethereum", 60))
        .await
        .unwrap();

    let err = db
        .create_token(&NewToken::new("eth", "Ethereum again", 60))
        .await
        .unwrap_err();
    assert!(matches!(err, insight_core::AppError::DatabaseError(_)));
}

#[tokio::test]
async fn due_tokens_respect_interval_and_order() {
    let (db, _container) = setup_test_db().await;
    let now = Utc::now();

    for (id, interval) in [("fresh", 60), ("stale", 60), ("never", 60), ("off", 60), ("edge", 60)] {
        db.create_token(&NewToken::new(id, id, interval))
            .await
            .unwrap();
    }
    db.mark_scraped("fresh", now - Duration::minutes(10))
        .await
        .unwrap();
    db.mark_scraped("stale", now - Duration::hours(5))
        .await
        .unwrap();
    db.mark_scraped("edge", now - Duration::minutes(60))
        .await
        .unwrap();
    db.mark_scraped("off", now - Duration::hours(9))
        .await
        .unwrap();
    assert!(db.set_enabled("off", false).await.unwrap());

    let ids: Vec<_> = db
        .due_tokens(now)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    // Never-scraped first, then oldest; the interval boundary is inclusive.
    assert_eq!(ids, vec!["never", "stale", "edge"]);
}

#[tokio::test]
async fn mark_scraped_updates_timestamp() {
    let (db, _container) = setup_test_db().await;
    db.create_token(&NewToken::new("sol", "Solana", 60))
        .await
        .unwrap();

    let at = Utc::now();
    db.mark_scraped("sol", at).await.unwrap();

    let token = db.get_token("sol").await.unwrap().unwrap();
    let stored = token.last_scraped_at.unwrap();
    assert!((stored - at).num_milliseconds().abs() < 1);
}

#[tokio::test]
async fn enable_disable_and_delete() {
    let (db, _container) = setup_test_db().await;
    db.create_token(&NewToken::new("dot", "Polkadot", 60))
        .await
        .unwrap();

    assert!(db.set_enabled("dot", false).await.unwrap());
    assert!(db.list_enabled().await.unwrap().is_empty());
    assert!(!db.set_enabled("missing", true).await.unwrap());

    assert!(db.delete_token("dot").await.unwrap());
    assert!(!db.delete_token("dot").await.unwrap());
    assert!(db.get_token("dot").await.unwrap().is_none());
}
