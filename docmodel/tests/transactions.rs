mod common;

use common::{Note, User, context};
use docmodel::prelude::*;
use docmodel::registry::DEFAULT_ALIAS;
use docmodel::transaction::begin;

#[tokio::test]
async fn test_with_transaction_commits() {
    let ctx = context().await;
    let users = ctx.model::<User>().unwrap();

    let handle = users.clone();
    let created = with_transaction(&ctx, DEFAULT_ALIAS, |session| async move {
        handle.with_session(&session).create(&User::new("Tx", None)).await
    })
    .await
    .unwrap();

    let stored = users.clone().find_by_id(created.id.unwrap()).await.unwrap();
    assert_eq!(stored.map(|user| user.name), Some("Tx".to_string()));
}

#[tokio::test]
async fn test_with_transaction_rolls_back_on_error() {
    let ctx = context().await;
    let users = ctx.model::<User>().unwrap();

    let handle = users.clone();
    let result: ModelResult<()> = with_transaction(&ctx, DEFAULT_ALIAS, |session| async move {
        handle.with_session(&session).create(&User::new("Gone", None)).await?;
        Err(ModelError::Query("changed my mind".into()))
    })
    .await;

    assert!(matches!(result, Err(ModelError::Query(_))));
    assert_eq!(users.clone().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_batch_commits_every_session() {
    let ctx = context().await;
    let users = ctx.model::<User>().unwrap();

    let first = users.clone();
    let second = users.clone();
    let report = TransactionBatch::new(&ctx)
        .add(DEFAULT_ALIAS, move |session| {
            first
                .with_session(&session)
                .upsert()
                .update_one(doc! { "name": "Ann" }, doc! { "$set": { "age": 30 } })
                .exec()
        })
        .add(DEFAULT_ALIAS, move |session| {
            second
                .with_session(&session)
                .upsert()
                .update_one(doc! { "name": "Bob" }, doc! { "$set": { "age": 31 } })
                .exec()
        })
        .run()
        .await;

    assert!(report.is_committed());
    assert_eq!(report.into_result().unwrap().len(), 2);
    assert_eq!(users.clone().count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_batch_rolls_back_on_failure() {
    let ctx = context().await;
    let users = ctx.model::<User>().unwrap();
    let ann = users.clone().create(&User::new("Ann", Some(30))).await.unwrap();
    let id = ann.id.unwrap();

    let renamer = users.clone();
    let failing = users.clone();
    let never = users.clone();
    let report = TransactionBatch::new(&ctx)
        .add(DEFAULT_ALIAS, move |session| {
            renamer
                .with_session(&session)
                .update_one(doc! { "_id": id }, doc! { "name": "Renamed" })
                .exec()
        })
        .add(DEFAULT_ALIAS, move |session| {
            failing
                .with_session(&session)
                .matching(doc! { "age": { "$bogus": 1 } })
                .exec()
        })
        .add(DEFAULT_ALIAS, move |session| {
            never.with_session(&session).delete_many(doc! {}).exec()
        })
        .run()
        .await;

    assert!(!report.is_committed());
    assert_eq!(report.results.len(), 1);
    assert!(matches!(report.errors.first(), Some(ModelError::Query(_))));

    let stored = users.clone().find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.name, "Ann");
}

#[tokio::test]
async fn test_batch_rollback_restores_shared_collection() {
    let ctx = context().await;
    let users = ctx.model::<User>().unwrap();
    let ann = users.clone().create(&User::new("Ann", Some(30))).await.unwrap();
    let id = ann.id.unwrap();

    let rename = users.clone();
    let age = users.clone();
    let failing = users.clone();
    let report = TransactionBatch::new(&ctx)
        .add(DEFAULT_ALIAS, move |session| {
            rename
                .with_session(&session)
                .update_one(doc! { "_id": id }, doc! { "$set": { "name": "First" } })
                .exec()
        })
        .add(DEFAULT_ALIAS, move |session| {
            age.with_session(&session)
                .update_one(doc! { "_id": id }, doc! { "$set": { "age": 99 } })
                .exec()
        })
        .add(DEFAULT_ALIAS, move |session| {
            failing
                .with_session(&session)
                .matching(doc! { "age": { "$bogus": 1 } })
                .exec()
        })
        .run()
        .await;

    assert!(!report.is_committed());
    assert_eq!(report.results.len(), 2);

    let stored = users.clone().find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.name, "Ann");
    assert_eq!(stored.age, Some(30));
}

#[tokio::test]
async fn test_audit_records_follow_the_transaction() {
    let ctx = context().await;
    let notes = ctx.model::<Note>().unwrap();
    let audit_logs = Namespace::new("app", "audit_logs");
    let connection = ctx.registry().get(DEFAULT_ALIAS).await.unwrap();

    let handle = notes.clone();
    let result: ModelResult<()> = with_transaction(&ctx, DEFAULT_ALIAS, |session| async move {
        handle
            .with_session(&session)
            .create(&Note {
                id: None,
                text: "draft".into(),
            })
            .await?;
        Err(ModelError::Query("discard".into()))
    })
    .await;
    assert!(result.is_err());
    assert_eq!(notes.clone().count().await.unwrap(), 0);
    assert!(connection.backend().aggregate(&audit_logs, Vec::new(), None).await.unwrap().is_empty());

    let handle = notes.clone();
    with_transaction(&ctx, DEFAULT_ALIAS, |session| async move {
        handle
            .with_session(&session)
            .create(&Note {
                id: None,
                text: "kept".into(),
            })
            .await
    })
    .await
    .unwrap();

    let records = connection.backend().aggregate(&audit_logs, Vec::new(), None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get_document("document").unwrap().get_str("text").unwrap(), "kept");
}

#[tokio::test]
async fn test_batch_reports_unknown_alias() {
    let ctx = context().await;
    let users = ctx.model::<User>().unwrap();

    let report = TransactionBatch::new(&ctx)
        .add("missing", move |session| users.with_session(&session).exec())
        .run()
        .await;

    assert!(!report.is_committed());
    assert!(matches!(report.into_result(), Err(ModelError::Configuration(_))));
}

#[tokio::test]
async fn test_session_alias_must_match_connection() {
    let ctx = context().await;
    docmodel::connect(&ctx, &Config::new("memory://local/reports").with_alias("reporting"))
        .await
        .unwrap();
    let users = ctx.model::<User>().unwrap();
    let session = begin(&ctx, "reporting").await.unwrap();

    assert_eq!(users.with_session(&session).count().await.unwrap(), 0);

    let err = users
        .with_connection(DEFAULT_ALIAS)
        .with_session(&session)
        .count()
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::Session(_)));

    session.abort().await.unwrap();
}
