//! Tests against a real Postgres. Run with:
//!
//! ```text
//! DATABASE_URL=postgres://... cargo test -p vparser-store -- --ignored
//! ```

use chrono::Utc;

use vparser_models::{FieldUpdate, NewVideoRequest};
use vparser_store::{JobStore, PgJobStore, StoreError};

async fn store() -> PgJobStore {
    let store = PgJobStore::from_env().await.expect("DATABASE_URL must point at Postgres");
    store.run_migrations().await.unwrap();
    store
}

fn unique_name(prefix: &str) -> String {
    format!(
        "{prefix}-{}",
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

async fn create(store: &PgJobStore, name: &str) -> Result<i64, StoreError> {
    let request = NewVideoRequest::new(name, "https://cdn.example.com/v.mp4");
    let created = store.create_with_outbox(&request).await?;
    Ok(created.outbox_id)
}

#[tokio::test]
#[ignore]
async fn test_name_reusable_only_after_archive() {
    let store = store().await;
    let name = unique_name("reuse");

    create(&store, &name).await.unwrap();
    let err = create(&store, &name).await.unwrap_err();
    assert!(err.is_duplicate());

    assert!(store.archive(&name).await.unwrap());
    assert!(!store.archive(&name).await.unwrap());
    create(&store, &name).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_update_touches_one_column_and_advances_timestamp() {
    let store = store().await;
    let name = unique_name("update");
    create(&store, &name).await.unwrap();

    let before = store.load(&name).await.unwrap().unwrap();
    store
        .apply_update(before.id, &FieldUpdate::Processed(true))
        .await
        .unwrap();
    let after = store.load(&name).await.unwrap().unwrap();

    assert!(after.processed);
    assert_eq!(after.description, before.description);
    assert_eq!(after.video_url, before.video_url);
    assert!(after.updated_at > before.updated_at);
}

#[tokio::test]
#[ignore]
async fn test_outbox_claim_and_publish() {
    let store = store().await;
    let name = unique_name("outbox");
    let outbox_id = create(&store, &name).await.unwrap();

    let claimed = store
        .claim_pending_outbox(Utc::now() + chrono::Duration::seconds(1), 1000)
        .await
        .unwrap();
    let entry = claimed.iter().find(|e| e.id == outbox_id).unwrap();
    assert_eq!(entry.payload.name, name);

    // The JSONB payload keeps the row's creation time exactly.
    let row = store.load(&name).await.unwrap().unwrap();
    assert_eq!(entry.payload.created_at, Some(row.created_at));

    store.mark_published(outbox_id).await.unwrap();
    let again = store
        .claim_pending_outbox(Utc::now() + chrono::Duration::seconds(1), 1000)
        .await
        .unwrap();
    assert!(again.iter().all(|e| e.id != outbox_id));
}
