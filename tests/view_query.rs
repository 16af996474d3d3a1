mod support;

use couchstream::{
    EntityExceptionBehaviour, Error, MangoQuery, ViewQuery, ViewQueryResultEvent, ViewRow,
};
use futures_util::stream::{StreamExt, TryStreamExt};
use reqwest::Method;
use serde_json::{json, Value};
use support::{client, json_body, query_param, FakeTransport, Patient};

fn view() -> ViewQuery {
    ViewQuery::new()
        .design_doc_id("_design/Patient")
        .view_name("by_name")
        .include_docs(true)
}

#[tokio::test]
async fn streams_metadata_and_rows_in_server_order() {
    let transport = FakeTransport::new();
    transport.push_json(
        200,
        json!({
            "total_rows": 3,
            "offset": 1,
            "update_seq": "42-g1AAAA",
            "rows": [
                {"id": "p1", "key": "ada", "value": 1, "doc": {"_id": "p1", "_rev": "1-a", "name": "Ada"}, "extra": {"deep": [1, 2]}},
                {"id": "p2", "key": "bob", "value": 2, "doc": null},
                {"id": "p3", "key": "cyd", "value": 3}
            ],
            "warning": "ignored"
        }),
    );
    let events: Vec<ViewQueryResultEvent<String, u32, Patient>> = client(&transport)
        .query_view(&view(), EntityExceptionBehaviour::Fail)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(events.len(), 6);
    assert!(matches!(events[0], ViewQueryResultEvent::TotalCount(3)));
    assert!(matches!(events[1], ViewQueryResultEvent::Offset(1)));
    assert!(matches!(events[2], ViewQueryResultEvent::UpdateSequence(42)));
    match &events[3] {
        ViewQueryResultEvent::Row(ViewRow::WithDoc { id, key, value, doc }) => {
            assert_eq!(id, "p1");
            assert_eq!(key.as_deref(), Some("ada"));
            assert_eq!(*value, Some(1));
            assert_eq!(doc.name, "Ada");
            assert_eq!(doc.rev.as_deref(), Some("1-a"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(
        events[4],
        ViewQueryResultEvent::Row(ViewRow::WithMissingDoc { .. })
    ));
    assert!(matches!(
        events[5],
        ViewQueryResultEvent::Row(ViewRow::WithMissingDoc { .. })
    ));

    let request = &transport.requests()[0];
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.url.path(), "/test/_design/Patient/_view/by_name");
    assert_eq!(query_param(request, "include_docs").as_deref(), Some("true"));
}

#[tokio::test]
async fn rows_without_docs_requested_are_no_doc() {
    let transport = FakeTransport::new();
    transport.push_json(
        200,
        json!({"total_rows": 1, "offset": null, "rows": [{"id": "p1", "key": ["a", 1], "value": null, "doc": {"_id": "p1"}}]}),
    );
    let query = ViewQuery::new().design_doc_id("Patient").view_name("all");
    let events: Vec<ViewQueryResultEvent> = client(&transport)
        .query_view(&query, EntityExceptionBehaviour::Fail)
        .try_collect()
        .await
        .unwrap();

    // a null offset is not reported
    assert_eq!(events.len(), 2);
    match &events[1] {
        ViewQueryResultEvent::Row(ViewRow::NoDoc { id, key, value }) => {
            assert_eq!(id, "p1");
            assert_eq!(key, &Some(json!(["a", 1])));
            assert_eq!(value, &None);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

fn mixed_docs() -> Value {
    json!({
        "total_rows": 3,
        "offset": 0,
        "rows": [
            {"id": "p1", "key": "p1", "value": {"rev": "1-a"}, "doc": {"_id": "p1", "name": "Ada"}},
            {"id": "p2", "key": "p2", "value": {"rev": "1-b"}, "doc": {"_id": "p2", "name": 12}},
            {"id": "p3", "key": "p3", "value": {"rev": "1-c"}, "doc": {"_id": "p3", "name": "Cyd"}}
        ]
    })
}

#[tokio::test]
async fn recover_surfaces_malformed_documents() {
    let transport = FakeTransport::new();
    transport.push_json(200, mixed_docs());
    let rows: Vec<ViewRow<String, Value, Patient>> = client(&transport)
        .query_view_rows(&ViewQuery::new().all_docs().include_docs(true), EntityExceptionBehaviour::Recover)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows.iter().filter(|r| r.doc().is_some()).count(), 2);
    let malformed = &rows[1];
    assert_eq!(malformed.id(), "p2");
    assert!(malformed.error().is_some());
    assert!(malformed.doc().is_none());
}

#[tokio::test]
async fn fail_aborts_on_malformed_document() {
    let transport = FakeTransport::new();
    transport.push_json(200, mixed_docs());
    let mut rows = Box::pin(client(&transport).query_view_rows::<String, Value, Patient>(
        &ViewQuery::new().all_docs().include_docs(true),
        EntityExceptionBehaviour::Fail,
    ));

    assert_eq!(rows.next().await.unwrap().unwrap().id(), "p1");
    match rows.next().await.unwrap() {
        Err(Error::Decode { id, field, .. }) => {
            assert_eq!(id, "p2");
            assert_eq!(field, "doc");
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(rows.next().await.is_none());
}

#[tokio::test]
async fn missing_view_can_be_skipped() {
    let transport = FakeTransport::new();
    let missing = json!({"error": "not_found", "reason": "missing_named_view"});
    transport.push_json(404, missing.clone());
    transport.push_json(404, missing);
    let client = client(&transport);

    let events: Vec<ViewQueryResultEvent> = client
        .query_view(&view().skip_if_view_does_not_exist(true), EntityExceptionBehaviour::Fail)
        .try_collect()
        .await
        .unwrap();
    assert!(events.is_empty());

    let error = client
        .query_view::<Value, Value, Value>(&view(), EntityExceptionBehaviour::Fail)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    assert!(error.is_not_found());
    assert!(error.server_error().unwrap().message.contains("missing_named_view"));
}

#[tokio::test]
async fn not_found_rows_are_ignored_only_on_request() {
    let body = json!({
        "total_rows": 10,
        "rows": [
            {"key": "nope", "error": "not_found"},
            {"id": "p1", "key": "p1", "value": {"rev": "1-a"}, "doc": {"_id": "p1", "name": "Ada"}}
        ]
    });
    let transport = FakeTransport::new();
    transport.push_json(200, body.clone());
    transport.push_json(200, body);
    let client = client(&transport);
    let query = ViewQuery::new().all_docs().keys(["nope", "p1"]).include_docs(true);

    let rows: Vec<ViewRow<String, Value, Patient>> = client
        .query_view_rows(&query.clone().ignore_not_found(true), EntityExceptionBehaviour::Fail)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(matches!(&rows[0], ViewRow::NoDoc { id, .. } if id.is_empty()));
    assert_eq!(rows[1].doc().unwrap().name, "Ada");

    let error = client
        .query_view_rows::<String, Value, Patient>(&query, EntityExceptionBehaviour::Fail)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    match error {
        Error::ViewResult { key, error } => {
            assert_eq!(key, Some(json!("nope")));
            assert_eq!(error, "not_found");
        }
        other => panic!("unexpected error {:?}", other),
    }

    let request = &transport.requests()[0];
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.url.path(), "/test/_all_docs");
    assert_eq!(json_body(request), json!({"keys": ["nope", "p1"]}));
}

#[tokio::test]
async fn top_level_error_fails_the_query() {
    let transport = FakeTransport::new();
    transport.push_json(200, json!({"total_rows": 0, "error": "timeout"}));
    let mut events = Box::pin(
        client(&transport).query_view::<Value, Value, Value>(&view(), EntityExceptionBehaviour::Fail),
    );
    assert!(matches!(
        events.next().await,
        Some(Ok(ViewQueryResultEvent::TotalCount(0)))
    ));
    assert!(matches!(
        events.next().await,
        Some(Err(Error::QueryFailed { error, .. })) if error == "timeout"
    ));
}

#[tokio::test]
async fn structural_errors_are_fatal() {
    let transport = FakeTransport::new();
    transport.push_json(200, json!([1, 2]));
    transport.push_json(200, json!({"rows": {"id": "x"}}));
    let client = client(&transport);
    for _ in 0..2 {
        let result = client
            .query_view::<Value, Value, Value>(&view(), EntityExceptionBehaviour::Recover)
            .try_collect::<Vec<_>>()
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}

#[tokio::test]
async fn mango_query_yields_docs_then_bookmark() {
    let transport = FakeTransport::new();
    transport.push_json(
        200,
        json!({
            "docs": [{"_id": "p1", "name": "Ada"}, {"_id": "p2", "name": "Bob"}],
            "bookmark": "g1AAAA",
            "execution_stats": {"total_docs_examined": 2}
        }),
    );
    let query = MangoQuery::new(json!({"name": {"$gt": null}})).limit(2);
    let events: Vec<ViewQueryResultEvent<Value, Value, Patient>> = client(&transport)
        .mango_query(&query)
        .try_collect()
        .await
        .unwrap();
    let results: Vec<_> = events
        .into_iter()
        .filter_map(ViewQueryResultEvent::into_mango_result)
        .collect();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].doc.as_ref().unwrap().name, "Ada");
    assert_eq!(results[1].doc.as_ref().unwrap().id, "p2");
    assert_eq!(results[2].doc, None);
    assert_eq!(results[2].bookmark.as_deref(), Some("g1AAAA"));

    let request = &transport.requests()[0];
    assert_eq!(request.url.path(), "/test/_find");
    assert_eq!(json_body(request)["limit"], json!(2));
}

#[tokio::test]
async fn mango_error_combines_error_and_reason() {
    let transport = FakeTransport::new();
    transport.push_json(200, json!({"error": "no_usable_index", "reason": "No index exists for this sort"}));
    let error = client(&transport)
        .mango_query::<Patient>(&MangoQuery::new(json!({})))
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    match error {
        Error::Mango { error, reason } => {
            assert_eq!(error, "no_usable_index");
            assert_eq!(reason, "No index exists for this sort");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn mango_error_reason_in_any_position() {
    let transport = FakeTransport::new();
    transport.push_with_headers(
        200,
        &[],
        r#"{"reason":"Unknown field","warning":"no matching index","error":"invalid_selector"}"#,
    );
    transport.push_with_headers(
        200,
        &[],
        r#"{"error":"invalid_selector","warning":"no matching index","reason":"Unknown field"}"#,
    );
    let client = client(&transport);
    for _ in 0..2 {
        let error = client
            .mango_query::<Patient>(&MangoQuery::new(json!({})))
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        match error {
            Error::Mango { error, reason } => {
                assert_eq!(error, "invalid_selector");
                assert_eq!(reason, "Unknown field");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
