//! Behaviour every provider must share, run by each adapter's tests.
//!
//! Each check gets a provider built by the caller's constructor, initializes
//! it, clears the `widget` type, and closes it when done, so the same suite
//! runs against fresh in-memory backends and against a shared database.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::StreamExt;
use metastore_core::types::{fields, MAX_DATE_MILLIS, MIN_DATE_MILLIS};
use metastore_core::{
    Clause, ClauseOp, ContinuationToken, EntityMetadataType, EntityUpdate, FieldMap, FieldSchema,
    FieldType, FieldValue, ProviderError, QueryDescriptor, SchemaRegistry, SortDirection,
};

use crate::stream::query_stream;
use crate::traits::EntityMetadataProvider;

pub(crate) fn widget() -> EntityMetadataType {
    EntityMetadataType::new("widget").unwrap()
}

pub(crate) fn widget_schema() -> FieldSchema {
    FieldSchema::new(widget())
        .required("name", FieldType::String)
        .field("count", FieldType::Number)
        .field("status", FieldType::String)
        .field("active", FieldType::Boolean)
        .field("created", FieldType::Date)
        .field("tags", FieldType::StringArray)
}

pub(crate) fn schemas() -> SchemaRegistry {
    SchemaRegistry::new().with(widget_schema())
}

fn named(name: &str) -> FieldMap {
    fields([("name", FieldValue::from(name))])
}

fn with(mut map: FieldMap, name: &str, value: impl Into<FieldValue>) -> FieldMap {
    map.insert(name.to_string(), value.into());
    map
}

async fn fresh<F>(make: &F) -> Arc<dyn EntityMetadataProvider>
where
    F: Fn() -> Arc<dyn EntityMetadataProvider>,
{
    let provider = make();
    provider.initialize().await.unwrap();
    provider.clear_type(&widget()).await.unwrap();
    provider
}

/// Runs every shared check against providers built by `make`.
pub(crate) async fn run_all<F>(make: F)
where
    F: Fn() -> Arc<dyn EntityMetadataProvider>,
{
    round_trips_every_field_type(fresh(&make).await).await;
    create_rejects_duplicates(fresh(&make).await).await;
    unstorable_values_are_rejected(fresh(&make).await).await;
    absent_records_are_not_found(fresh(&make).await).await;
    replace_and_merge(fresh(&make).await).await;
    versioned_updates(fresh(&make).await).await;
    concurrent_stale_updates(fresh(&make).await).await;
    filtered_query_pages(fresh(&make).await).await;
    sorted_query_pages(fresh(&make).await).await;
    clause_semantics(fresh(&make).await).await;
    tokens_are_bound_to_their_query(fresh(&make).await).await;
    page_size_limits(fresh(&make).await).await;
    clear_type_removes_everything(fresh(&make).await).await;
    widget_scenario(fresh(&make).await).await;
    initialize_is_idempotent(fresh(&make).await).await;
}

async fn round_trips_every_field_type(p: Arc<dyn EntityMetadataProvider>) {
    let full = fields([
        ("name", FieldValue::from("Widget \"one\"")),
        ("count", FieldValue::Number(3.25)),
        ("status", FieldValue::from("open")),
        ("active", FieldValue::Boolean(true)),
        ("created", FieldValue::Date(1_700_000_000_123)),
        (
            "tags",
            FieldValue::StringArray(vec!["red".into(), "a,b".into(), "[x]".into()]),
        ),
    ]);
    let created = p.create(&widget(), "w1", full.clone()).await.unwrap();
    assert_eq!(created.fields, full);
    assert!(created.version.is_some());

    let fetched = p.get(&widget(), "w1").await.unwrap();
    assert_eq!(fetched.entity_type, widget());
    assert_eq!(fetched.entity_id, "w1");
    assert_eq!(fetched.fields, full);
    assert_eq!(fetched.version, created.version);

    let sparse = with(named("sparse"), "tags", Vec::<String>::new());
    p.create(&widget(), "w2", sparse.clone()).await.unwrap();
    assert_eq!(p.get(&widget(), "w2").await.unwrap().fields, sparse);

    p.create(&widget(), "w3", named("bare")).await.unwrap();
    assert_eq!(p.get(&widget(), "w3").await.unwrap().fields, named("bare"));
    p.close().await.unwrap();
}

async fn create_rejects_duplicates(p: Arc<dyn EntityMetadataProvider>) {
    p.create(&widget(), "dup", named("first")).await.unwrap();
    let err = p.create(&widget(), "dup", named("second")).await.unwrap_err();
    assert!(matches!(err, ProviderError::Conflict { .. }), "{err:?}");
    assert_eq!(
        p.get(&widget(), "dup").await.unwrap().fields,
        named("first")
    );

    let err = p.create(&widget(), "", named("x")).await.unwrap_err();
    assert!(matches!(err, ProviderError::Validation { .. }), "{err:?}");
    let err = p
        .create(&widget(), "nameless", FieldMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Validation { .. }), "{err:?}");
    p.close().await.unwrap();
}

async fn unstorable_values_are_rejected(p: Arc<dyn EntityMetadataProvider>) {
    let bad = [
        ("created", FieldValue::Date(i64::MAX)),
        ("created", FieldValue::Date(MIN_DATE_MILLIS - 1)),
        ("name", FieldValue::from("a\0b")),
        ("tags", FieldValue::StringArray(vec!["ok".into(), "n\0l".into()])),
    ];
    for (field, value) in bad {
        let err = p
            .create(&widget(), "odd", with(named("odd"), field, value.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation { .. }), "{value:?}: {err:?}");
    }
    assert!(p.get(&widget(), "odd").await.unwrap_err().is_not_found());

    p.create(&widget(), "edge", named("edge")).await.unwrap();
    let err = p
        .update(
            &widget(),
            "edge",
            EntityUpdate::merge(fields([("created", FieldValue::Date(MAX_DATE_MILLIS + 1))])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Validation { .. }), "{err:?}");

    let limits = with(
        with(named("edge"), "created", FieldValue::Date(MIN_DATE_MILLIS)),
        "status",
        "x",
    );
    p.update(&widget(), "edge", EntityUpdate::replace(limits.clone()))
        .await
        .unwrap();
    assert_eq!(p.get(&widget(), "edge").await.unwrap().fields, limits);
    p.close().await.unwrap();
}

async fn absent_records_are_not_found(p: Arc<dyn EntityMetadataProvider>) {
    assert!(p.get(&widget(), "ghost").await.unwrap_err().is_not_found());
    assert!(p
        .update(&widget(), "ghost", EntityUpdate::merge(named("x")))
        .await
        .unwrap_err()
        .is_not_found());
    assert!(p.delete(&widget(), "ghost").await.unwrap_err().is_not_found());

    p.create(&widget(), "gone", named("x")).await.unwrap();
    p.delete(&widget(), "gone").await.unwrap();
    assert!(p.get(&widget(), "gone").await.unwrap_err().is_not_found());
    assert!(p.delete(&widget(), "gone").await.unwrap_err().is_not_found());
    p.close().await.unwrap();
}

async fn replace_and_merge(p: Arc<dyn EntityMetadataProvider>) {
    let initial = with(with(named("A"), "count", 1), "status", "open");
    p.create(&widget(), "m1", initial).await.unwrap();

    let merged = p
        .update(&widget(), "m1", EntityUpdate::merge(fields([("count", FieldValue::from(2))])))
        .await
        .unwrap();
    assert_eq!(
        merged.fields,
        with(with(named("A"), "count", 2), "status", "open")
    );

    let replaced = p
        .update(&widget(), "m1", EntityUpdate::replace(named("B")))
        .await
        .unwrap();
    assert_eq!(replaced.fields, named("B"));
    assert_eq!(p.get(&widget(), "m1").await.unwrap().fields, named("B"));

    let err = p
        .update(
            &widget(),
            "m1",
            EntityUpdate::replace(fields([("count", FieldValue::from(9))])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Validation { .. }), "{err:?}");

    let err = p
        .update(
            &widget(),
            "m1",
            EntityUpdate::merge(fields([("count", FieldValue::from("nine"))])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Validation { .. }), "{err:?}");
    p.close().await.unwrap();
}

async fn versioned_updates(p: Arc<dyn EntityMetadataProvider>) {
    let created = p.create(&widget(), "v1", named("A")).await.unwrap();
    let v1 = created.version.unwrap();

    let updated = p
        .update(&widget(), "v1", EntityUpdate::merge(named("B")).if_version(v1.clone()))
        .await
        .unwrap();
    let v2 = updated.version.unwrap();
    assert_ne!(v1, v2);

    let err = p
        .update(&widget(), "v1", EntityUpdate::merge(named("C")).if_version(v1.clone()))
        .await
        .unwrap_err();
    match err {
        ProviderError::ConcurrencyConflict { expected, actual, .. } => {
            assert_eq!(expected, v1.as_str());
            assert_eq!(actual, v2.as_str());
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }

    let last = p
        .update(&widget(), "v1", EntityUpdate::merge(named("D")))
        .await
        .unwrap();
    assert_eq!(last.fields, named("D"));
    assert_eq!(p.get(&widget(), "v1").await.unwrap().version, last.version);
    p.close().await.unwrap();
}

async fn concurrent_stale_updates(p: Arc<dyn EntityMetadataProvider>) {
    let created = p.create(&widget(), "race", named("start")).await.unwrap();
    let version = created.version.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let p = Arc::clone(&p);
            let update = EntityUpdate::merge(named(&format!("writer-{i}"))).if_version(version.clone());
            tokio::spawn(async move { p.update(&widget(), "race", update).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(ProviderError::ConcurrencyConflict { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(succeeded, 1);
    p.close().await.unwrap();
}

async fn filtered_query_pages(p: Arc<dyn EntityMetadataProvider>) {
    let mut expected = BTreeSet::new();
    for i in 0..25 {
        let id = format!("q{i:02}");
        let status = if i % 3 == 0 { "open" } else { "closed" };
        if i % 3 == 0 {
            expected.insert(id.clone());
        }
        p.create(&widget(), &id, with(with(named("q"), "status", status), "count", i))
            .await
            .unwrap();
    }

    let query = QueryDescriptor::new(widget()).where_eq("status", "open").page_size(4);
    let mut seen = Vec::new();
    let mut pages = 0;
    let mut token: Option<ContinuationToken> = None;
    loop {
        let page = p.query(&query.clone().continue_from(token)).await.unwrap();
        pages += 1;
        assert!(page.items.len() <= 4);
        for record in &page.items {
            assert_eq!(record.field("status"), Some(&FieldValue::from("open")));
        }
        seen.extend(page.items.into_iter().map(|r| r.entity_id));
        token = page.continuation;
        if token.is_none() {
            break;
        }
    }
    assert!(pages >= 3);
    assert_eq!(seen.len(), expected.len(), "no record returned twice");
    assert_eq!(seen.into_iter().collect::<BTreeSet<_>>(), expected);

    let streamed: Vec<String> = query_stream(
        Arc::clone(&p),
        QueryDescriptor::new(widget()).page_size(7),
    )
    .map(|r| r.unwrap().entity_id)
    .collect()
    .await;
    assert_eq!(streamed.len(), 25);
    p.close().await.unwrap();
}

async fn sorted_query_pages(p: Arc<dyn EntityMetadataProvider>) {
    let counts = [5.0, -1.0, 12.5, 5.0, 0.0];
    for (i, count) in counts.iter().enumerate() {
        p.create(&widget(), &format!("s{i}"), with(named("s"), "count", *count))
            .await
            .unwrap();
    }
    p.create(&widget(), "s_none", named("s")).await.unwrap();

    let collect = |direction| {
        let p = Arc::clone(&p);
        async move {
            query_stream(
                p,
                QueryDescriptor::new(widget())
                    .sort_by("count", direction)
                    .page_size(2),
            )
            .map(|r| r.unwrap().entity_id)
            .collect::<Vec<_>>()
            .await
        }
    };
    assert_eq!(
        collect(SortDirection::Asc).await,
        ["s1", "s4", "s0", "s3", "s2", "s_none"]
    );
    assert_eq!(
        collect(SortDirection::Desc).await,
        ["s_none", "s2", "s0", "s3", "s4", "s1"]
    );

    let err = p
        .query(&QueryDescriptor::new(widget()).sort_by("tags", SortDirection::Asc))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::InvalidQuery { .. }), "{err:?}");
    p.close().await.unwrap();
}

async fn clause_semantics(p: Arc<dyn EntityMetadataProvider>) {
    let tagged = |tags: &[&str]| {
        FieldValue::StringArray(tags.iter().map(|t| (*t).to_string()).collect())
    };
    p.create(&widget(), "c1", with(with(named("c"), "tags", tagged(&["red", "blue"])), "count", 1))
        .await
        .unwrap();
    p.create(&widget(), "c2", with(with(named("c"), "tags", tagged(&["blue"])), "count", 20))
        .await
        .unwrap();
    p.create(&widget(), "c3", with(named("c"), "active", false))
        .await
        .unwrap();

    let ids = |descriptor: QueryDescriptor| {
        let p = Arc::clone(&p);
        async move {
            let mut ids: Vec<String> = p
                .query(&descriptor)
                .await
                .unwrap()
                .items
                .into_iter()
                .map(|r| r.entity_id)
                .collect();
            ids.sort();
            ids
        }
    };

    assert_eq!(ids(QueryDescriptor::new(widget()).where_eq("tags", "red")).await, ["c1"]);
    assert_eq!(ids(QueryDescriptor::new(widget()).where_eq("tags", "blue")).await, ["c1", "c2"]);
    assert_eq!(
        ids(QueryDescriptor::new(widget()).filter(Clause::new("tags", ClauseOp::Ne, "red"))).await,
        ["c2"]
    );
    assert_eq!(
        ids(QueryDescriptor::new(widget()).filter(Clause::new("count", ClauseOp::Gt, 1))).await,
        ["c2"]
    );
    assert_eq!(
        ids(QueryDescriptor::new(widget()).filter(Clause::new("count", ClauseOp::Ne, 1))).await,
        ["c2"]
    );
    assert_eq!(
        ids(QueryDescriptor::new(widget()).where_eq("active", false)).await,
        ["c3"]
    );
    assert_eq!(
        ids(QueryDescriptor::new(widget())
            .where_eq("name", "c")
            .filter(Clause::new("count", ClauseOp::Lte, 20)))
        .await,
        ["c1", "c2"]
    );

    for bad in [
        QueryDescriptor::new(widget()).filter(Clause::new("tags", ClauseOp::Gt, "a")),
        QueryDescriptor::new(widget()).where_eq("colour", "red"),
        QueryDescriptor::new(widget()).where_eq("count", "1"),
    ] {
        let err = p.query(&bad).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidQuery { .. }), "{err:?}");
    }
    p.close().await.unwrap();
}

async fn tokens_are_bound_to_their_query(p: Arc<dyn EntityMetadataProvider>) {
    for i in 0..5 {
        p.create(&widget(), &format!("t{i}"), with(named("t"), "status", "open"))
            .await
            .unwrap();
    }
    let open = QueryDescriptor::new(widget()).where_eq("status", "open").page_size(2);
    let token = p.query(&open).await.unwrap().continuation;
    assert!(token.is_some());

    let other = QueryDescriptor::new(widget())
        .where_eq("status", "closed")
        .page_size(2)
        .continue_from(token.clone());
    let err = p.query(&other).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidQuery { .. }), "{err:?}");

    let forged = open
        .clone()
        .continue_from(Some(ContinuationToken::from_string("bm90LWEtdG9rZW4")));
    assert!(matches!(
        p.query(&forged).await,
        Err(ProviderError::InvalidQuery { .. })
    ));

    let resumed = p.query(&open.continue_from(token)).await.unwrap();
    assert_eq!(resumed.items.len(), 2);
    p.close().await.unwrap();
}

async fn page_size_limits(p: Arc<dyn EntityMetadataProvider>) {
    for size in [0, metastore_core::query::MAX_PAGE_SIZE + 1] {
        let err = p
            .query(&QueryDescriptor::new(widget()).page_size(size))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidQuery { .. }), "{err:?}");
    }
    let page = p
        .query(&QueryDescriptor::new(widget()).page_size(metastore_core::query::MAX_PAGE_SIZE))
        .await
        .unwrap();
    assert!(page.items.is_empty());
    assert!(page.continuation.is_none());
    p.close().await.unwrap();
}

async fn clear_type_removes_everything(p: Arc<dyn EntityMetadataProvider>) {
    for i in 0..130 {
        p.create(&widget(), &format!("x{i:03}"), named("x")).await.unwrap();
    }
    let report = p.clear_type(&widget()).await.unwrap();
    assert_eq!(report.deleted, 130);
    assert!(p.query(&QueryDescriptor::new(widget())).await.unwrap().items.is_empty());
    assert!(p.get(&widget(), "x000").await.unwrap_err().is_not_found());

    assert_eq!(p.clear_type(&widget()).await.unwrap().deleted, 0);
    p.create(&widget(), "x000", named("again")).await.unwrap();
    p.close().await.unwrap();
}

async fn widget_scenario(p: Arc<dyn EntityMetadataProvider>) {
    let initial = fields([
        ("name", FieldValue::from("Widget")),
        ("count", FieldValue::from(3)),
    ]);
    let created = p.create(&widget(), "w1", initial.clone()).await.unwrap();
    assert_eq!(p.get(&widget(), "w1").await.unwrap().fields, initial);

    p.update(&widget(), "w1", EntityUpdate::merge(fields([("name", FieldValue::from("Other"))])))
        .await
        .unwrap();

    let stale = EntityUpdate::merge(fields([("count", FieldValue::from(4))]))
        .if_version(created.version.unwrap());
    let err = p.update(&widget(), "w1", stale).await.unwrap_err();
    assert!(matches!(err, ProviderError::ConcurrencyConflict { .. }), "{err:?}");

    let current = p.get(&widget(), "w1").await.unwrap();
    let retry = EntityUpdate::merge(fields([("count", FieldValue::from(4))]))
        .if_version(current.version.unwrap());
    let updated = p.update(&widget(), "w1", retry).await.unwrap();
    assert_eq!(updated.field("count"), Some(&FieldValue::Number(4.0)));

    p.delete(&widget(), "w1").await.unwrap();
    assert!(matches!(
        p.get(&widget(), "w1").await,
        Err(ProviderError::NotFound { .. })
    ));
    p.close().await.unwrap();
}

async fn initialize_is_idempotent(p: Arc<dyn EntityMetadataProvider>) {
    p.create(&widget(), "keep", named("kept")).await.unwrap();
    p.initialize().await.unwrap();
    assert_eq!(p.get(&widget(), "keep").await.unwrap().fields, named("kept"));
    p.close().await.unwrap();
    p.close().await.unwrap();
}
