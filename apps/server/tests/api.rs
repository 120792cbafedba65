//! End-to-end tests that drive the router the way the web client does.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use sqlx::SqlitePool;
use tower::ServiceExt;

use barbershop_booking::auth::{sign_token, Role};
use barbershop_booking::clock::{Clock, FixedClock};
use barbershop_booking::engine::automation::AutomationScheduler;
use barbershop_booking::engine::slots::intervals_overlap;
use barbershop_booking::engine::{Engine, EngineSettings};
use barbershop_booking::error::AppError;
use barbershop_booking::gateway::{GatewayError, GatewayStatus, PaymentGateway, PaymentSession, SessionRequest};
use barbershop_booking::notifier::StoreNotifier;
use barbershop_booking::rate_limit::{RateLimitConfig, RateLimiter, Tier};
use barbershop_booking::models::CreateBookingRequest;
use barbershop_booking::{db, router, AppState};

const SECRET: &str = "api-test-secret";
const SERVER_KEY: &str = "server-key";

#[derive(Default)]
struct StubGateway {
    sessions: Mutex<Vec<String>>,
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn create_session(&self, request: &SessionRequest) -> Result<PaymentSession, GatewayError> {
        self.sessions.lock().unwrap().push(request.order_id.clone());
        Ok(PaymentSession {
            token: format!("tok-{}", request.order_id),
            redirect_url: format!("https://pay.test/{}", request.order_id),
        })
    }

    async fn query_status(&self, _order_id: &str) -> Result<GatewayStatus, GatewayError> {
        Ok(GatewayStatus::NotFound)
    }
}

struct TestApp {
    app: Router,
    clock: Arc<FixedClock>,
}

/// Monday 2030-01-07 08:00 UTC.
fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 7, 8, 0, 0).unwrap()
}

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 7, h, m, 0).unwrap()
}

async fn seed(pool: &SqlitePool) {
    for sql in [
        "INSERT INTO customers (id, name) VALUES ('cust-1', 'Ana')",
        "INSERT INTO customers (id, name) VALUES ('cust-2', 'Budi')",
        "INSERT INTO shops (id, owner_id, name) VALUES ('shop-1', 'owner-1', 'Fade Street')",
        "INSERT INTO services (id, shop_id, name, price, duration_minutes) VALUES ('svc-60', 'shop-1', 'Haircut', 150000, 60)",
        "INSERT INTO staff (id, shop_id, name, created_at) VALUES ('staff-a', 'shop-1', 'Agus', '2029-01-01T00:00:00+00:00')",
        "INSERT INTO staff (id, shop_id, name, created_at) VALUES ('staff-b', 'shop-1', 'Bayu', '2029-02-01T00:00:00+00:00')",
    ] {
        sqlx::query(sql).execute(pool).await.unwrap();
    }
}

fn engine_on(pool: SqlitePool, clock: Arc<dyn Clock>) -> Arc<Engine> {
    Arc::new(Engine::new(
        pool.clone(),
        Arc::new(StubGateway::default()),
        Arc::new(StoreNotifier::new(pool, clock)),
        EngineSettings {
            utc_offset: FixedOffset::east_opt(0).unwrap(),
            frontend_url: "https://app.test".into(),
            verify_expiry_with_gateway: true,
        },
    ))
}

async fn test_app(limiter: RateLimiter) -> TestApp {
    let pool = db::in_memory().await.unwrap();
    seed(&pool).await;

    let clock = Arc::new(FixedClock::new(start()));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let engine = engine_on(pool, dyn_clock.clone());
    let automation = Arc::new(AutomationScheduler::new(engine.clone(), dyn_clock.clone()));

    let state = Arc::new(AppState {
        engine,
        clock: dyn_clock,
        automation,
        auth_secret: SECRET.into(),
        gateway_server_key: SERVER_KEY.into(),
        started_at: Instant::now(),
    });

    TestApp {
        app: router(state, limiter),
        clock,
    }
}

fn token(role: Role, user: &str) -> String {
    sign_token(SECRET, role, user, start() + Duration::days(365)).unwrap()
}

fn request(method: Method, uri: &str, bearer: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(t) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {t}"));
    }
    match body {
        Some(v) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn create(app: &Router, customer: &str, staff: Option<&str>, time: DateTime<Utc>) -> (StatusCode, Value) {
    let t = token(Role::Customer, customer);
    let body = json!({
        "shop_id": "shop-1",
        "service_id": "svc-60",
        "staff_id": staff,
        "booking_time": time,
    });
    send(app, request(Method::POST, "/api/bookings", Some(&t), Some(body))).await
}

/// A correctly signed settlement notification, as the gateway sends it.
async fn settle(app: &Router, order_id: &str) -> (StatusCode, Value) {
    let body = json!({
        "order_id": order_id,
        "transaction_status": "settlement",
        "fraud_status": "accept",
        "status_code": "200",
        "gross_amount": "150000.00",
        "signature_key": signature(order_id, "200", "150000.00"),
    });
    send(app, request(Method::POST, "/api/payments/webhook", None, Some(body))).await
}

fn signature(order_id: &str, status_code: &str, gross_amount: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(format!("{order_id}{status_code}{gross_amount}{SERVER_KEY}").as_bytes());
    hex::encode(hasher.finalize())
}

#[tokio::test]
async fn test_health() {
    let t = test_app(RateLimiter::new()).await;
    let (status, body) = send(&t.app, request(Method::GET, "/api/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db_ok"], true);
}

#[tokio::test]
async fn test_booking_flow_through_check_in_and_completion() {
    let t = test_app(RateLimiter::new()).await;

    let (status, body) = create(&t.app, "cust-1", None, at(10, 0)).await;
    assert_eq!(status, StatusCode::CREATED);
    let booking = &body["data"]["booking"];
    assert_eq!(booking["status"], "pending_payment");
    assert_eq!(booking["staff_id"], "staff-a");
    assert_eq!(booking["can_pay"], true);
    assert!(body["data"]["payment"]["redirect_url"].as_str().unwrap().starts_with("https://pay.test/"));
    let id = booking["id"].as_str().unwrap().to_string();
    let order_id = booking["order_id"].as_str().unwrap().to_string();

    let (status, body) = settle(&t.app, &order_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "Confirmed");

    let customer = token(Role::Customer, "cust-1");
    let (_, body) = send(&t.app, request(Method::GET, &format!("/api/bookings/{id}"), Some(&customer), None)).await;
    assert_eq!(body["data"]["status"], "confirmed");
    let qr = body["data"]["qr_code_token"].as_str().unwrap().to_string();

    // Too early: window opens at 09:00.
    let (status, body) = send(
        &t.app,
        request(Method::POST, "/api/bookings/check-in/qr", Some(&customer), Some(json!({ "qr_token": qr }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "too_early");

    t.clock.set(at(9, 45));
    let (status, body) = send(
        &t.app,
        request(Method::POST, "/api/bookings/check-in/qr", Some(&customer), Some(json!({ "qr_token": qr }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "checked_in");
    assert_eq!(body["data"]["check_in_method"], "qr_code");

    let owner = token(Role::Owner, "owner-1");
    let (status, _) = send(&t.app, request(Method::POST, &format!("/api/owner/bookings/{id}/start"), Some(&owner), None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) =
        send(&t.app, request(Method::POST, &format!("/api/owner/bookings/{id}/complete"), Some(&owner), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "awaiting_confirmation");

    let (status, body) = send(
        &t.app,
        request(Method::POST, &format!("/api/bookings/{id}/confirm-completion"), Some(&customer), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["can_review"], true);

    // Completed is terminal.
    let (status, body) =
        send(&t.app, request(Method::POST, &format!("/api/owner/bookings/{id}/start"), Some(&owner), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "invalid_state");
}

#[tokio::test]
async fn test_concurrent_requests_for_same_staff_book_once() {
    let t = test_app(RateLimiter::new()).await;

    let (first, second) = tokio::join!(
        create(&t.app, "cust-1", Some("staff-a"), at(10, 0)),
        create(&t.app, "cust-2", Some("staff-a"), at(10, 30)),
    );
    let statuses = [first.0, second.0];
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::CREATED).count(), 1);
    let loser = if first.0 == StatusCode::CREATED { second.1 } else { first.1 };
    assert_eq!(loser["kind"], "conflict");
    assert_eq!(loser["reason"], "staff_busy");
}

/// Many overlapping creations racing on a multi-connection WAL database.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_creations_never_double_book_staff() {
    let path = std::env::temp_dir().join(format!("barbershop-race-{}.db", uuid::Uuid::new_v4()));
    let pool = db::connect(&format!("sqlite:{}?mode=rwc", path.display()), 5).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    seed(&pool).await;
    let engine = engine_on(pool.clone(), Arc::new(FixedClock::new(start())));

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let staff_choices = [None, Some("staff-a"), Some("staff-b")];
    let attempts: Vec<CreateBookingRequest> = (0..40)
        .map(|_| CreateBookingRequest {
            shop_id: "shop-1".into(),
            service_id: "svc-60".into(),
            staff_id: staff_choices[rng.gen_range(0..staff_choices.len())].map(str::to_string),
            booking_time: at(10, 0) + Duration::minutes(15 * rng.gen_range(0..4)),
        })
        .collect();

    let handles: Vec<_> = attempts
        .into_iter()
        .enumerate()
        .map(|(i, req)| {
            let engine = engine.clone();
            let customer = if i % 2 == 0 { "cust-1" } else { "cust-2" };
            tokio::spawn(async move { engine.create_booking(customer, &req, start()).await })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(AppError::Conflict { reason, .. }) => {
                assert!(
                    matches!(reason.as_str(), "staff_busy" | "fully_booked"),
                    "unexpected conflict: {}",
                    reason.as_str()
                );
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!((1..=2).contains(&created), "created {created} bookings for two staff");

    let held: Vec<(String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
        "SELECT staff_id, booking_time, end_time FROM bookings
         WHERE status NOT IN ('cancelled', 'no_show')",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(held.len(), created);
    for (i, a) in held.iter().enumerate() {
        for b in &held[i + 1..] {
            assert!(
                a.0 != b.0 || !intervals_overlap(a.1, a.2, b.1, b.2),
                "{} double-booked: {:?} and {:?}",
                a.0,
                a.1,
                b.1
            );
        }
    }

    pool.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

#[tokio::test]
async fn test_fully_booked_when_every_staff_busy() {
    let t = test_app(RateLimiter::new()).await;
    assert_eq!(create(&t.app, "cust-1", None, at(10, 0)).await.0, StatusCode::CREATED);
    assert_eq!(create(&t.app, "cust-2", None, at(10, 0)).await.0, StatusCode::CREATED);

    let (status, body) = create(&t.app, "cust-1", None, at(10, 30)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "fully_booked");

    let (status, body) = send(
        &t.app,
        request(Method::GET, "/api/availability?shop_id=shop-1&date=2030-01-07", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["fully_booked_times"], json!(["10:00"]));
    assert_eq!(body["data"]["total_staff"], 2);

    let (_, body) = send(
        &t.app,
        request(Method::GET, "/api/availability?shop_id=shop-1&date=2030-01-07&time=11:00", None, None),
    )
    .await;
    assert_eq!(body["data"]["available_staff_count"], 2);
}

#[tokio::test]
async fn test_availability_rejects_bad_date() {
    let t = test_app(RateLimiter::new()).await;
    let (status, body) = send(
        &t.app,
        request(Method::GET, "/api/availability?shop_id=shop-1&date=2030-13-01", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");
}

#[tokio::test]
async fn test_auth_required_and_role_checked() {
    let t = test_app(RateLimiter::new()).await;

    let (status, body) = send(&t.app, request(Method::GET, "/api/bookings/my", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["ok"], false);

    let owner = token(Role::Owner, "owner-1");
    let (status, _) = send(&t.app, request(Method::GET, "/api/bookings/my", Some(&owner), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let customer = token(Role::Customer, "cust-1");
    let (status, _) = send(
        &t.app,
        request(Method::GET, "/api/owner/shops/shop-1/bookings", Some(&customer), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Another owner's shop.
    let stranger = token(Role::Owner, "owner-9");
    let (status, _) = send(
        &t.app,
        request(Method::GET, "/api/owner/shops/shop-1/bookings", Some(&stranger), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_other_customers_booking_is_forbidden() {
    let t = test_app(RateLimiter::new()).await;
    let (_, body) = create(&t.app, "cust-1", None, at(10, 0)).await;
    let id = body["data"]["booking"]["id"].as_str().unwrap().to_string();

    let other = token(Role::Customer, "cust-2");
    let (status, _) = send(&t.app, request(Method::GET, &format!("/api/bookings/{id}"), Some(&other), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_webhook_unknown_order_is_acknowledged() {
    let t = test_app(RateLimiter::new()).await;
    let (status, body) = settle(&t.app, "BOOK-missing").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "unknown_order");
}

#[tokio::test]
async fn test_webhook_signature_checked_when_present() {
    let t = test_app(RateLimiter::new()).await;
    let (_, body) = create(&t.app, "cust-1", None, at(10, 0)).await;
    let order_id = body["data"]["booking"]["order_id"].as_str().unwrap().to_string();

    let forged = json!({
        "order_id": order_id,
        "transaction_status": "settlement",
        "status_code": "200",
        "gross_amount": "150000.00",
        "signature_key": "deadbeef",
    });
    let (status, _) = send(&t.app, request(Method::POST, "/api/payments/webhook", None, Some(forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signed = json!({
        "order_id": order_id,
        "transaction_status": "settlement",
        "status_code": "200",
        "gross_amount": "150000.00",
        "signature_key": signature(&order_id, "200", "150000.00"),
    });
    let (status, body) = send(&t.app, request(Method::POST, "/api/payments/webhook", None, Some(signed))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "Confirmed");

    // Redelivery is idempotent.
    let (status, body) = settle(&t.app, &order_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "AlreadyConfirmed");
}

#[tokio::test]
async fn test_unsigned_webhook_rejected_when_key_configured() {
    let t = test_app(RateLimiter::new()).await;
    let (_, body) = create(&t.app, "cust-1", None, at(10, 0)).await;
    let id = body["data"]["booking"]["id"].as_str().unwrap().to_string();
    let order_id = body["data"]["booking"]["order_id"].as_str().unwrap().to_string();

    let unsigned = json!({
        "order_id": order_id,
        "transaction_status": "settlement",
        "fraud_status": "accept",
    });
    let (status, body) = send(&t.app, request(Method::POST, "/api/payments/webhook", None, Some(unsigned))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "unauthorized");

    // A signature without the fields it covers is just as incomplete.
    let partial = json!({
        "order_id": order_id,
        "transaction_status": "settlement",
        "signature_key": signature(&order_id, "200", "150000.00"),
    });
    let (status, _) = send(&t.app, request(Method::POST, "/api/payments/webhook", None, Some(partial))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let customer = token(Role::Customer, "cust-1");
    let (_, body) = send(&t.app, request(Method::GET, &format!("/api/bookings/{id}"), Some(&customer), None)).await;
    assert_eq!(body["data"]["status"], "pending_payment");
    assert_eq!(body["data"]["payment_status"], "pending");
    assert!(body["data"]["qr_code_token"].is_null());
}

#[tokio::test]
async fn test_schedule_change_conflicts_then_forced() {
    let t = test_app(RateLimiter::new()).await;
    assert_eq!(create(&t.app, "cust-1", None, at(10, 0)).await.0, StatusCode::CREATED);

    let owner = token(Role::Owner, "owner-1");
    let closed_mondays = json!({
        "schedule": {
            "monday": { "is_open": false },
            "tuesday": { "is_open": true, "open_time": "09:00", "close_time": "18:00" },
        },
    });

    let (status, body) = send(
        &t.app,
        request(
            Method::POST,
            "/api/owner/shops/shop-1/schedule/preview",
            Some(&owner),
            Some(closed_mondays.clone()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["reason"], "day_closed");

    let (status, body) = send(
        &t.app,
        request(Method::PUT, "/api/owner/shops/shop-1/schedule", Some(&owner), Some(closed_mondays)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "schedule_conflict");
    assert_eq!(body["details"].as_array().unwrap().len(), 1);

    let (_, body) = send(&t.app, request(Method::GET, "/api/owner/shops/shop-1/schedule", Some(&owner), None)).await;
    assert!(body["data"].is_null());

    let forced = json!({
        "schedule": { "monday": { "is_open": false } },
        "force_update": true,
    });
    let (status, body) = send(
        &t.app,
        request(Method::PUT, "/api/owner/shops/shop-1/schedule", Some(&owner), Some(forced)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["unresolved"].as_array().unwrap().len(), 1);

    let (_, body) = send(&t.app, request(Method::GET, "/api/owner/shops/shop-1/schedule", Some(&owner), None)).await;
    assert_eq!(body["data"]["monday"]["is_open"], false);
}

#[tokio::test]
async fn test_staff_deactivation_and_reassignment() {
    let t = test_app(RateLimiter::new()).await;
    assert_eq!(create(&t.app, "cust-1", Some("staff-a"), at(10, 0)).await.0, StatusCode::CREATED);

    let owner = token(Role::Owner, "owner-1");
    let (status, body) = send(
        &t.app,
        request(Method::POST, "/api/owner/staff/staff-a/deactivate", Some(&owner), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_active"], false);
    assert_eq!(body["data"]["affected"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &t.app,
        request(
            Method::POST,
            "/api/owner/staff/staff-a/reassign",
            Some(&owner),
            Some(json!({ "new_staff_id": "staff-b" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["moved"].as_array().unwrap().len(), 1);

    let (_, body) = send(
        &t.app,
        request(Method::GET, "/api/owner/staff/staff-a/deactivation-impact", Some(&owner), None),
    )
    .await;
    assert!(body["data"]["affected"].as_array().unwrap().is_empty());

    let (status, body) = send(
        &t.app,
        request(Method::POST, "/api/owner/staff/staff-a/activate", Some(&owner), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_active"], true);
}

#[tokio::test]
async fn test_booking_tier_is_rate_limited() {
    let limiter = RateLimiter::new();
    limiter.add_tier(
        Tier::Booking,
        RateLimitConfig {
            max_requests: 1,
            window: std::time::Duration::from_secs(300),
        },
    );
    let t = test_app(limiter).await;

    assert_eq!(create(&t.app, "cust-1", None, at(10, 0)).await.0, StatusCode::CREATED);
    let (status, body) = create(&t.app, "cust-1", None, at(12, 0)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["kind"], "rate_limited");

    // Other tiers are untouched.
    let customer = token(Role::Customer, "cust-1");
    let (status, body) = send(&t.app, request(Method::GET, "/api/bookings/my", Some(&customer), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}
