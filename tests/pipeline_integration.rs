//! End-to-end tests driving the HTTP router in-process.

use adserve_backend::{
    api::{create_router, AppState},
    config::PipelineConfig,
    keystore::MemoryKeyStore,
    matching::MatchingOrchestrator,
    models::{
        AdSlot, BidModel, Campaign, CampaignStatus, Creative, FraudStatus, Publisher, Targeting,
    },
    store::AdStore,
};
use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const BROWSER_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_5) AppleWebKit/605.1.15";

fn campaign(id: &str, bid: f64, total_budget: f64) -> Campaign {
    Campaign {
        id: id.to_string(),
        advertiser_id: format!("adv-{}", id),
        bid_model: BidModel::Cpm,
        bid_amount: bid,
        total_budget,
        spent_budget: 0.0,
        daily_budget: None,
        targeting: Targeting::default(),
        creative: Creative {
            format: "banner".to_string(),
            width: Some(300),
            height: Some(250),
            url: format!("https://cdn.example/{}.png", id),
        },
        landing_url: format!("https://advertiser.example/{}", id),
        status: CampaignStatus::Active,
        start_date: None,
        end_date: None,
        requires_viewability: false,
    }
}

async fn setup() -> (Router, Arc<MatchingOrchestrator>) {
    let store = AdStore::in_memory().unwrap();
    store
        .upsert_publisher(&Publisher {
            id: "pub-1".to_string(),
            quality_score: 0.9,
            categories: vec!["news".to_string()],
        })
        .await
        .unwrap();
    store
        .upsert_slot(&AdSlot {
            id: "slot-1".to_string(),
            publisher_id: "pub-1".to_string(),
            format: "banner".to_string(),
            width: Some(300),
            height: Some(250),
            floor_cpm: None,
        })
        .await
        .unwrap();

    let orchestrator = Arc::new(MatchingOrchestrator::with_seed(
        store,
        Arc::new(MemoryKeyStore::new()),
        None,
        PipelineConfig::default(),
        42,
    ));
    let app = create_router(AppState::new(orchestrator.clone()));
    (app, orchestrator)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::USER_AGENT, BROWSER_UA)
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::empty())
        .unwrap()
}

fn get_as(uri: &str, user_agent: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::USER_AGENT, user_agent)
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    post_json_as(uri, body, BROWSER_UA, "203.0.113.7")
}

fn post_json_as(uri: &str, body: Value, user_agent: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::USER_AGENT, user_agent)
        .header("x-forwarded-for", ip)
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn impression_body(campaign_id: &str) -> Value {
    json!({
        "campaign_id": campaign_id,
        "publisher_id": "pub-1",
        "slot_id": "slot-1",
        "geo": "US",
        "device": "desktop",
    })
}

fn as_json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_health_and_metrics_without_recorder() {
    let (app, _) = setup().await;

    let (status, _, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["status"], "ok");

    let (status, _, _) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_serve_returns_ranked_ads() {
    let (app, o) = setup().await;
    for (id, bid) in [("low", 2.0), ("high", 9.0), ("mid", 5.0), ("tail", 1.0)] {
        o.store().insert_campaign(&campaign(id, bid, 100.0)).await.unwrap();
    }

    let (status, _, body) = send(
        &app,
        get("/api/ads/serve?publisher_id=pub-1&slot_id=slot-1&format=banner&geo=US"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let ads = as_json(&body)["ads"].as_array().unwrap().clone();
    let ids: Vec<&str> = ads.iter().map(|a| a["campaign_id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["high", "mid", "low"]);
    assert_eq!(ads[0]["ecpm"], 9.0);
}

#[tokio::test]
async fn test_serve_status_mapping() {
    let (app, _) = setup().await;

    let (status, _, body) = send(&app, get("/api/ads/serve?publisher_id=pub-1&slot_id=slot-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(as_json(&body)["error"].as_str().unwrap().contains("format"));

    let (status, _, _) = send(
        &app,
        get("/api/ads/serve?publisher_id=pub-1&slot_id=slot-1&format=banner"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_impression_status_mapping() {
    let (app, o) = setup().await;
    o.store().insert_campaign(&campaign("c1", 10.0, 100.0)).await.unwrap();
    o.store().insert_campaign(&campaign("broke", 10.0, 0.005)).await.unwrap();

    let (status, _, body) = send(&app, post_json("/api/track/impression/imp-1", impression_body("c1"))).await;
    assert_eq!(status, StatusCode::OK);
    let logged = as_json(&body);
    assert_eq!(logged["status"], "logged");
    assert_eq!(logged["fraud_status"], "clean");
    assert_eq!(logged["revenue"], 0.01);

    let (status, _, body) = send(&app, post_json("/api/track/impression/imp-1", impression_body("c1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["status"], "already_logged");

    let (status, _, _) = send(&app, post_json("/api/track/impression/imp-2", impression_body("broke"))).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let (status, _, _) = send(
        &app,
        post_json_as(
            "/api/track/impression/imp-3",
            impression_body("c1"),
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            "203.0.113.8",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = send(&app, post_json("/api/track/impression/imp-4", impression_body("nope"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(
        &app,
        post_json("/api/track/impression/imp-5", json!({ "campaign_id": "c1", "publisher_id": "pub-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // one clean billed impression only
    let c = o.store().get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(c.spent_budget, 0.01);
}

#[tokio::test]
async fn test_concurrent_impressions_never_overspend() {
    let (app, o) = setup().await;
    // room for exactly five 0.01 impressions
    o.store().insert_campaign(&campaign("tight", 10.0, 0.05)).await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..20 {
        let app = app.clone();
        tasks.spawn(async move {
            let request = post_json_as(
                &format!("/api/track/impression/imp-{}", i),
                impression_body("tight"),
                BROWSER_UA,
                &format!("198.51.100.{}", i + 1),
            );
            app.oneshot(request).await.unwrap().status()
        });
    }

    let mut ok = 0;
    let mut exhausted = 0;
    while let Some(status) = tasks.join_next().await {
        match status.unwrap() {
            StatusCode::OK => ok += 1,
            StatusCode::PAYMENT_REQUIRED => exhausted += 1,
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(exhausted, 15);

    let state = o.budget_state("tight").await.unwrap();
    assert_eq!(state.spent_budget, 0.05);
    assert_eq!(state.remaining_budget, 0.0);
}

#[tokio::test]
async fn test_pixel_always_returns_gif() {
    let (app, o) = setup().await;
    o.store().insert_campaign(&campaign("c1", 10.0, 100.0)).await.unwrap();

    let (status, headers, body) = send(
        &app,
        get("/api/track/pixel/imp-px?campaign_id=c1&publisher_id=pub-1&slot_id=slot-1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/gif");
    assert!(body.starts_with(b"GIF89a"));
    assert!(o.store().get_impression("imp-px").await.unwrap().is_some());

    // invalid tracking parameters still render the pixel
    let (status, headers, _) = send(&app, get("/api/track/pixel/imp-bad")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/gif");
    assert!(o.store().get_impression("imp-bad").await.unwrap().is_none());
}

#[tokio::test]
async fn test_click_redirects_and_conversion_attributes() {
    let (app, o) = setup().await;
    o.store().insert_campaign(&campaign("c1", 10.0, 100.0)).await.unwrap();

    send(&app, post_json("/api/track/impression/imp-1", impression_body("c1"))).await;

    let click_uri = "/api/track/click/imp-1?campaign_id=c1&publisher_id=pub-1&slot_id=slot-1";
    let (status, headers, _) = send(&app, get(click_uri)).await;
    assert!(status.is_redirection());
    assert_eq!(headers[header::LOCATION], "https://advertiser.example/c1");

    // a duplicate click still redirects
    let (status, headers, _) = send(&app, get(click_uri)).await;
    assert!(status.is_redirection());
    assert_eq!(headers[header::LOCATION], "https://advertiser.example/c1");

    let (status, _, _) = send(
        &app,
        get("/api/track/click/imp-1?campaign_id=missing&publisher_id=pub-1&slot_id=slot-1"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let conversion = json!({ "conversion_type": "purchase", "conversion_value": 49.0 });
    let (status, _, body) = send(&app, post_json("/api/track/conversion/imp-1", conversion.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let result = as_json(&body);
    assert_eq!(result["attributed"], true);
    assert!(result["time_to_conversion_seconds"].as_i64().unwrap() >= 0);

    let (status, _, _) = send(&app, post_json("/api/track/conversion/imp-1", conversion)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = send(
        &app,
        post_json("/api/track/conversion/imp-nothing", json!({ "conversion_type": "purchase" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(
        &app,
        post_json(
            "/api/track/conversion/imp-1",
            json!({ "conversion_type": "signup", "attribution_window_days": -1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_viewability_bills_gated_impression_once() {
    let (app, o) = setup().await;
    let mut gated = campaign("gated", 10.0, 100.0);
    gated.requires_viewability = true;
    o.store().insert_campaign(&gated).await.unwrap();

    let (_, _, body) = send(&app, post_json("/api/track/impression/imp-v", impression_body("gated"))).await;
    assert_eq!(as_json(&body)["revenue"], Value::Null);

    let measurement = json!({
        "slot_id": "slot-1",
        "viewable_time": 1200,
        "total_time": 4000,
        "viewport_percentage": 75.0,
    });
    let (status, _, body) = send(&app, post_json("/api/track/viewability/imp-v", measurement.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let first = as_json(&body);
    assert_eq!(first["viewable"], true);
    assert_eq!(first["billed"], true);

    let (status, _, body) = send(&app, post_json("/api/track/viewability/imp-v", measurement.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["billed"], false);

    let (status, _, _) = send(&app, post_json("/api/track/viewability/imp-none", measurement)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(
        &app,
        post_json(
            "/api/track/viewability/imp-v",
            json!({ "slot_id": "slot-1", "viewable_time": 5000, "total_time": 1000, "viewport_percentage": 60.0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(&app, get("/api/campaigns/gated/budget")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["spent_budget"], 0.01);
}

#[tokio::test]
async fn test_budget_and_ivt_report_endpoints() {
    let (app, o) = setup().await;
    o.store().insert_campaign(&campaign("c1", 10.0, 100.0)).await.unwrap();

    send(&app, post_json("/api/track/impression/imp-1", impression_body("c1"))).await;
    send(
        &app,
        post_json_as(
            "/api/track/impression/imp-2",
            impression_body("c1"),
            "curl/8.4.0",
            "203.0.113.50",
        ),
    )
    .await;

    let (status, _, _) = send(&app, get("/api/campaigns/missing/budget")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = send(&app, get("/api/reports/ivt")).await;
    assert_eq!(status, StatusCode::OK);
    let report = as_json(&body);
    assert_eq!(report["total_impressions"], 2);
    assert_eq!(report["givt_events"], 1);

    let (status, _, _) = send(&app, get("/api/reports/ivt?date=yesterday")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_click_with_missing_context_still_redirects() {
    let (app, o) = setup().await;
    o.store().insert_campaign(&campaign("c1", 10.0, 100.0)).await.unwrap();

    let (status, headers, _) = send(&app, get("/api/track/click/imp-1?campaign_id=c1")).await;
    assert!(status.is_redirection());
    assert_eq!(headers[header::LOCATION], "https://advertiser.example/c1");
    assert!(o
        .store()
        .latest_click_for_impression("imp-1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_blocked_click_still_redirects() {
    let (app, o) = setup().await;
    o.store().insert_campaign(&campaign("c1", 10.0, 100.0)).await.unwrap();

    // bot user agent and no slot
    let (status, headers, _) = send(
        &app,
        get_as("/api/track/click/imp-1?campaign_id=c1&publisher_id=pub-1", "curl/8.4.0"),
    )
    .await;
    assert!(status.is_redirection());
    assert_eq!(headers[header::LOCATION], "https://advertiser.example/c1");

    // bot user agent with full context is stored blocked and unbilled
    let (status, headers, _) = send(
        &app,
        get_as(
            "/api/track/click/imp-2?campaign_id=c1&publisher_id=pub-1&slot_id=slot-1",
            "Googlebot/2.1 (+http://www.google.com/bot.html)",
        ),
    )
    .await;
    assert!(status.is_redirection());
    assert_eq!(headers[header::LOCATION], "https://advertiser.example/c1");

    let stored = o
        .store()
        .latest_click_for_impression("imp-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.fraud_status, FraudStatus::Blocked);
    assert_eq!(stored.revenue, None);
}
