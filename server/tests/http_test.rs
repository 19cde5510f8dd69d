use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use ingestion::processor::IngestionPipeline;
use llm::client::MockLlm;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use storage::{Catalog, VectorStore};
use tempfile::tempdir;
use tower::ServiceExt;

const CLASSIFIER_JSON: &str = r#"{"category_level_1": "Marketing", "category_level_2_sub": "Content", "extraction_confidence": 0.9}"#;

async fn test_app(dir: &Path) -> Router {
    let catalog = Catalog::open(dir.join("catalog.db")).await.unwrap();
    let vector = Arc::new(VectorStore::open(dir.join("rag_db"), "chunks").await.unwrap());
    let pipeline = Arc::new(IngestionPipeline::new(
        catalog.clone(),
        vector.clone(),
        Arc::new(MockLlm::fixed(CLASSIFIER_JSON)),
    ));
    let cache = server::SearchCache::new(dir.join("search_cache.json"), 24);
    server::app(server::AppState::new(
        catalog,
        vector,
        pipeline,
        dir.join("taxonomy_master.json"),
        cache,
    ))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn form_request(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn multipart_request(uri: &str, file_name: &str, content: &[u8]) -> Request<Body> {
    let boundary = "millrace-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\r\n",
            file_name
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn ingest_text_processes_and_reports_counters() {
    let dir = tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let response = app
        .oneshot(form_request(
            "/admin/ingest_text",
            "doc_id=blog1&text=AI+is+transforming+marketing+content...&category=marketing",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["result"], "processed");
    assert_eq!(json["total_chunks"], 1);
    assert_eq!(json["new_vectors"], 1);
}

#[tokio::test]
async fn upload_route_accepts_multipart_files() {
    let dir = tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let response = app
        .oneshot(multipart_request(
            "/ingest/manual/upload",
            "notes.txt",
            b"Uploaded file body that becomes a chunk.",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["result"], "processed");
}

#[tokio::test]
async fn admin_ingest_file_route_is_registered_once_and_works() {
    let dir = tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let response = app
        .oneshot(multipart_request(
            "/admin/ingest_file",
            "admin.txt",
            b"Admin-side file ingest path.",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn search_returns_ingested_chunks_and_caches() {
    let dir = tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let response = app
        .clone()
        .oneshot(form_request(
            "/admin/ingest_text",
            "doc_id=doc1&text=Quarterly+revenue+summary+for+the+board",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/search_rag?query=revenue%20summary")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["cached"], false);
    assert!(!json["results"].as_array().unwrap().is_empty());

    // Second identical query comes from the cache.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/search_rag?query=revenue%20summary")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["cached"], true);
}

#[tokio::test]
async fn clear_rag_empties_the_vector_store() {
    let dir = tempdir().unwrap();
    let app = test_app(dir.path()).await;

    app.clone()
        .oneshot(form_request(
            "/admin/ingest_text",
            "doc_id=doc1&text=Some+content+to+vectorize",
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/admin/clear_rag")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["removed_vectors"], 1);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/ingest_sources/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["vectors"], 0);
    assert_eq!(json["chunks"], 1); // catalog remains authoritative
}

#[tokio::test]
async fn ingest_sources_listing_and_retry() {
    let dir = tempdir().unwrap();
    let catalog = Catalog::open(dir.path().join("catalog.db")).await.unwrap();
    let vector = Arc::new(VectorStore::open(dir.path().join("rag_db"), "chunks").await.unwrap());
    let pipeline = Arc::new(IngestionPipeline::new(
        catalog.clone(),
        vector.clone(),
        Arc::new(MockLlm::fixed(CLASSIFIER_JSON)),
    ));
    let cache = server::SearchCache::new(dir.path().join("cache.json"), 24);
    let app = server::app(server::AppState::new(
        catalog.clone(),
        vector,
        pipeline,
        dir.path().join("taxonomy_master.json"),
        cache,
    ));

    catalog
        .ensure_source("https://example.com/feed.xml".to_string())
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/ingest_sources")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/admin/ingest_sources/retry/https%3A%2F%2Fexample.com%2Ffeed.xml")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/admin/ingest_sources/retry/unknown-feed")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn taxonomy_sync_list_and_match() {
    let dir = tempdir().unwrap();
    let master = r#"{
        "version": "1",
        "industries": { "values": ["Retail"], "synonyms": {} }
    }"#;
    tokio::fs::write(dir.path().join("taxonomy_master.json"), master)
        .await
        .unwrap();
    let app = test_app(dir.path()).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/taxonomy/sync")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["inserted"], 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/taxonomy")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/taxonomy/match?text=Retail")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["subcategory"], "Retail");
}

#[tokio::test]
async fn cache_admin_endpoints_report_and_clear() {
    let dir = tempdir().unwrap();
    let app = test_app(dir.path()).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/cache/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "empty");

    // Populate via a search, then clear.
    app.clone()
        .oneshot(form_request(
            "/admin/ingest_text",
            "doc_id=doc1&text=Cache+population+content",
        ))
        .await
        .unwrap();
    app.clone()
        .oneshot(
            Request::builder()
                .uri("/admin/search_rag?query=population")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/cache/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["status"], "active");
    assert_eq!(json["entries"], 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/admin/cache/expired")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["removed_entries"], 0); // nothing expired yet

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/admin/cache/clear")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["status"], "success");
}
