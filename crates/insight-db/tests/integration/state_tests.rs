use insight_core::traits::StateStore;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn state_round_trip_and_overwrite() {
    let (db, _container) = setup_test_db().await;

    assert_eq!(db.get_state("last_run").await.unwrap(), None);

    db.set_state("last_run", "2026-01-01T00:00:00Z").await.unwrap();
    db.set_state("last_run", "2026-01-02T00:00:00Z").await.unwrap();

    assert_eq!(
        db.get_state("last_run").await.unwrap().as_deref(),
        Some("2026-01-02T00:00:00Z")
    );
}
