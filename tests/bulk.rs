mod support;

use couchstream::{EntityExceptionBehaviour, Error, IdAndRev, PaginationEvent, ViewQueryResultEvent, ViewRow};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::Method;
use serde_json::{json, Value};
use support::{client, json_body, FakeTransport, Patient};

#[tokio::test]
async fn bulk_update_streams_per_document_results() {
    let transport = FakeTransport::new();
    transport.push_json(
        201,
        json!([
            {"ok": true, "id": "p1", "rev": "2-a"},
            {"id": "p2", "error": "conflict", "reason": "Document update conflict."}
        ]),
    );
    let mut p1 = Patient::new("p1", "Ada");
    p1.rev = Some("1-a".into());
    let p2 = Patient::new("p2", "Bob");

    let results: Vec<_> = client(&transport)
        .bulk_update(&[p1, p2])
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert_eq!(results[0].rev.as_deref(), Some("2-a"));
    assert!(!results[1].is_ok());
    assert_eq!(results[1].error.as_deref(), Some("conflict"));

    let request = &transport.requests()[0];
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.url.path(), "/test/_bulk_docs");
    let body = json_body(request);
    assert_eq!(body["all_or_nothing"], json!(false));
    assert_eq!(body["docs"][0]["_rev"], json!("1-a"));
    assert!(body["docs"][1].get("_rev").is_none());
}

#[tokio::test]
async fn bulk_update_rejects_malformed_revisions_up_front() {
    let transport = FakeTransport::new();
    let mut patient = Patient::new("p1", "Ada");
    patient.rev = Some("".into());
    let error = client(&transport).bulk_update(&[patient]).await.err().unwrap();
    assert!(matches!(error, Error::InvalidArgument(_)));
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn bulk_delete_marks_documents_deleted() {
    let transport = FakeTransport::new();
    transport.push_json(201, json!([{"ok": true, "id": "p1", "rev": "3-c"}]));
    transport.push_json(201, json!([{"ok": true, "id": "p2", "rev": "2-b"}]));
    let client = client(&transport);

    let mut patient = Patient::new("p1", "Ada");
    patient.rev = Some("2-b".into());
    let results: Vec<_> = client
        .bulk_delete(&[patient])
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(results[0].is_ok());

    let ids = [IdAndRev::new("p2", Some("1-a".into()))];
    let results: Vec<_> = client
        .bulk_delete_by_id_and_rev(&ids)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(results[0].id, "p2");

    let requests = transport.requests();
    assert_eq!(
        json_body(&requests[0])["docs"],
        json!([{"_id": "p1", "_rev": "2-b", "_deleted": true}])
    );
    assert_eq!(
        json_body(&requests[1])["docs"],
        json!([{"_id": "p2", "_rev": "1-a", "_deleted": true}])
    );
}

fn all_docs_page(ids: &[&str], offset: Value, update_seq: Value) -> Value {
    let rows: Vec<Value> = ids
        .iter()
        .map(|id| {
            if id.starts_with("missing") {
                json!({"key": id, "error": "not_found"})
            } else {
                json!({"id": id, "key": id, "value": {"rev": "1-a"}, "doc": {"_id": id, "name": format!("name {}", id)}})
            }
        })
        .collect();
    json!({"total_rows": 1000, "offset": offset, "update_seq": update_seq, "rows": rows})
}

#[tokio::test]
async fn pagination_batches_ids_and_merges_metadata() {
    let transport = FakeTransport::new();
    transport.push_json(200, all_docs_page(&["p0", "missing1"], json!(5), json!(7)));
    transport.push_json(200, all_docs_page(&["p100"], json!(3), json!("12-g1AA")));
    transport.push_json(200, all_docs_page(&["p200", "p249"], json!(null), json!(9)));

    let ids = stream::iter((0..250).map(|i| format!("p{}", i)));
    let events: Vec<PaginationEvent<Patient>> = client(&transport)
        .get_for_pagination(ids, EntityExceptionBehaviour::Fail)
        .try_collect()
        .await
        .unwrap();

    let rows: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            ViewQueryResultEvent::Row(row) => Some(row.id()),
            _ => None,
        })
        .collect();
    assert_eq!(rows, vec!["p0", "p100", "p200", "p249"]);
    let trailing = &events[4..];
    assert!(matches!(
        trailing,
        [
            ViewQueryResultEvent::TotalCount(3000),
            ViewQueryResultEvent::Offset(3),
            ViewQueryResultEvent::UpdateSequence(12)
        ]
    ));

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    let batch_sizes: Vec<usize> = requests
        .iter()
        .map(|r| json_body(r)["keys"].as_array().unwrap().len())
        .collect();
    assert_eq!(batch_sizes, vec![100, 100, 50]);
    assert_eq!(json_body(&requests[2])["keys"][0], json!("p200"));
    assert!(requests.iter().all(|r| r.url.path() == "/test/_all_docs"));
}

#[tokio::test]
async fn pagination_without_ids_only_reports_totals() {
    let transport = FakeTransport::new();
    let events: Vec<PaginationEvent<Patient>> = client(&transport)
        .get_for_pagination(stream::empty(), EntityExceptionBehaviour::Fail)
        .try_collect()
        .await
        .unwrap();
    assert!(matches!(events.as_slice(), [ViewQueryResultEvent::TotalCount(0)]));
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn get_many_yields_documents_only() {
    let transport = FakeTransport::new();
    transport.push_json(200, all_docs_page(&["p1", "missing", "p3"], json!(0), json!(null)));
    let ids = stream::iter(vec!["p1".to_string(), "missing".to_string(), "p3".to_string()]);
    let docs: Vec<Patient> = client(&transport)
        .get_many(ids, EntityExceptionBehaviour::Fail)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(
        docs.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
        vec!["p1", "p3"]
    );
}

fn page_with_malformed_doc() -> Value {
    json!({
        "total_rows": 2,
        "offset": 0,
        "rows": [
            {"id": "p1", "key": "p1", "value": {"rev": "1-a"}, "doc": {"_id": "p1", "name": []}},
            {"id": "p2", "key": "p2", "value": {"rev": "1-b"}, "doc": {"_id": "p2", "name": "Bob"}}
        ]
    })
}

#[tokio::test]
async fn pagination_recovers_or_fails_on_malformed_documents() {
    let transport = FakeTransport::new();
    transport.push_json(200, page_with_malformed_doc());
    transport.push_json(200, page_with_malformed_doc());
    let client = client(&transport);
    let ids = || stream::iter(vec!["p1".to_string(), "p2".to_string()]);

    let events: Vec<PaginationEvent<Patient>> = client
        .get_for_pagination(ids(), EntityExceptionBehaviour::Recover)
        .try_collect()
        .await
        .unwrap();
    assert!(matches!(
        &events[0],
        ViewQueryResultEvent::Row(ViewRow::WithMalformedDoc { id, .. }) if id == "p1"
    ));
    assert!(matches!(&events[1], ViewQueryResultEvent::Row(ViewRow::WithDoc { .. })));

    let mut events = Box::pin(client.get_for_pagination::<Patient, _>(ids(), EntityExceptionBehaviour::Fail));
    assert!(matches!(events.next().await, Some(Err(Error::Decode { .. }))));
    assert!(events.next().await.is_none());
}
