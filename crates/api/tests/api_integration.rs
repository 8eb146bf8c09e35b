//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::config::Config;
use api::{Backend, Services, build, create_app};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use checkout::{ExpiryListener, PaymentOutcome};
use common::{AggregateId, ManualClock};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

const SECRET: &str = "whsec_api_test";

struct TestApp {
    app: Router,
    services: Services,
    clock: ManualClock,
}

fn setup() -> TestApp {
    let clock = ManualClock::default();
    let config = Config {
        payment_webhook_secret: SECRET.to_string(),
        ..Config::default()
    };
    let services = build(
        &config,
        Backend::in_memory(Arc::new(clock.clone())),
        Arc::new(clock.clone()),
    );
    let app = create_app(services.state.clone(), get_metrics_handle());
    TestApp {
        app,
        services,
        clock,
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    async fn restock(&self, product_id: &str, quantity: u32) {
        let (status, _) = self
            .send(json_request(
                "POST",
                &format!("/products/{product_id}/restock"),
                json!({ "quantity": quantity }),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    /// milk-1l: 5 units, atta-5kg: 3 units.
    async fn stocked(self) -> Self {
        self.restock("milk-1l", 5).await;
        self.restock("atta-5kg", 3).await;
        self
    }

    async fn stock(&self, product_id: &str) -> Value {
        let (status, json) = self
            .send(get_request(&format!("/products/{product_id}/stock")))
            .await;
        assert_eq!(status, StatusCode::OK);
        json
    }

    async fn place(&self, milk: u32, atta: u32) -> (StatusCode, Value) {
        self.send(json_request(
            "POST",
            "/orders",
            json!({
                "user_id": Uuid::new_v4(),
                "items": [
                    { "product_id": "milk-1l", "quantity": milk, "unit_price_minor": 6000 },
                    { "product_id": "atta-5kg", "quantity": atta, "unit_price_minor": 27500 },
                ],
                "payment_method": "upi",
            }),
        ))
        .await
    }

    async fn pending_order(&self) -> String {
        let (status, json) = self.place(2, 1).await;
        assert_eq!(status, StatusCode::CREATED);
        json["order_id"].as_str().unwrap().to_string()
    }

    async fn order(&self, order_id: &str) -> Value {
        let (status, json) = self.send(get_request(&format!("/orders/{order_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        json
    }

    fn evidence(&self, order_id: &str, outcome: PaymentOutcome) -> Value {
        let id = AggregateId::from_uuid(Uuid::parse_str(order_id).unwrap());
        let evidence = self.services.gateway.settle(id, outcome).unwrap().unwrap();
        serde_json::to_value(evidence).unwrap()
    }

    async fn pay(&self, order_id: &str, outcome: PaymentOutcome) -> (StatusCode, Value) {
        let evidence = self.evidence(order_id, outcome);
        self.send(json_request(
            "POST",
            &format!("/orders/{order_id}/payment"),
            evidence,
        ))
        .await
    }
}

mod service {
    use super::*;

    #[tokio::test]
    async fn health_check() {
        let t = setup();
        let (status, json) = t.send(get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_checkout_metrics() {
        let t = setup().stocked().await;
        t.pending_order().await;

        let response = t.app.clone().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("checkout_duration_seconds"));
    }
}

mod products {
    use super::*;

    #[tokio::test]
    async fn restock_creates_and_grows_the_row() {
        let t = setup();
        t.restock("milk-1l", 5).await;
        t.restock("milk-1l", 2).await;

        let stock = t.stock("milk-1l").await;
        assert_eq!(stock["product_id"], "milk-1l");
        assert_eq!(stock["available_quantity"], 7);
        assert_eq!(stock["reserved_quantity"], 0);
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let t = setup();
        let (status, json) = t.send(get_request("/products/ghee-1kg/stock")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("ghee-1kg"));
    }

    #[tokio::test]
    async fn zero_restock_is_bad_request() {
        let t = setup();
        let (status, _) = t
            .send(json_request(
                "POST",
                "/products/milk-1l/restock",
                json!({ "quantity": 0 }),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn movements_trace_every_change() {
        let t = setup().stocked().await;
        let order_id = t.pending_order().await;
        t.pay(&order_id, PaymentOutcome::Captured).await;

        let (status, json) = t.send(get_request("/products/milk-1l/movements")).await;
        assert_eq!(status, StatusCode::OK);

        let kinds: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["kind"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["RESTOCK", "RESERVE", "CONFIRM"]);
    }
}

mod orders {
    use super::*;

    #[tokio::test]
    async fn create_reserves_stock_and_returns_intent() {
        let t = setup().stocked().await;

        let (status, json) = t.place(2, 1).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["status"], "PAYMENT_PENDING");
        assert_eq!(json["payment_intent"], "pi_0001");
        assert_eq!(t.stock("milk-1l").await["reserved_quantity"], 2);
        assert_eq!(t.stock("atta-5kg").await["reserved_quantity"], 1);
    }

    #[tokio::test]
    async fn insufficient_stock_is_conflict_with_detail() {
        let t = setup().stocked().await;

        let (status, json) = t.place(2, 4).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["status"], "STOCK_REJECTED");
        assert_eq!(json["reason"], "insufficient_stock");
        assert_eq!(json["product_id"], "atta-5kg");
        assert_eq!(json["requested"], 4);
        assert_eq!(json["available"], 3);

        // The milk reservation taken first was released.
        assert_eq!(t.stock("milk-1l").await["reserved_quantity"], 0);
    }

    #[tokio::test]
    async fn empty_basket_is_bad_request() {
        let t = setup();
        let (status, json) = t
            .send(json_request(
                "POST",
                "/orders",
                json!({ "user_id": Uuid::new_v4(), "items": [] }),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn get_order_shows_state_and_timeline() {
        let t = setup().stocked().await;
        let order_id = t.pending_order().await;

        let json = t.order(&order_id).await;

        assert_eq!(json["order_id"], order_id.as_str());
        assert_eq!(json["status"], "PAYMENT_PENDING");
        assert_eq!(json["total_minor"], 2 * 6000 + 27500);
        assert_eq!(json["currency"], "INR");
        assert_eq!(json["payment_ref"], "pi_0001");
        assert_eq!(json["items"].as_array().unwrap().len(), 2);
        assert_eq!(json["reservation_ids"].as_array().unwrap().len(), 2);
        assert_eq!(json["flagged_for_fraud"], false);

        let events: Vec<&str> = json["timeline"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["event_type"].as_str().unwrap())
            .collect();
        assert_eq!(
            events,
            vec!["OrderPlaced", "StockReserved", "PaymentIntentCreated"]
        );
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let t = setup();
        let (status, _) = t
            .send(get_request(&format!("/orders/{}", Uuid::new_v4())))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_order_id_is_bad_request() {
        let t = setup();
        let (status, json) = t.send(get_request("/orders/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("not-a-uuid"));
    }

    #[tokio::test]
    async fn cancel_pending_order_releases_stock() {
        let t = setup().stocked().await;
        let order_id = t.pending_order().await;

        let (status, json) = t
            .send(json_request(
                "POST",
                &format!("/orders/{order_id}/cancel"),
                json!({ "reason": "changed my mind" }),
            ))
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "CANCELLED");
        assert_eq!(t.stock("milk-1l").await["reserved_quantity"], 0);
        assert_eq!(t.stock("milk-1l").await["available_quantity"], 5);
    }

    #[tokio::test]
    async fn cancel_after_confirmation_conflicts_and_refund_closes() {
        let t = setup().stocked().await;
        let order_id = t.pending_order().await;
        t.pay(&order_id, PaymentOutcome::Captured).await;

        let (status, _) = t
            .send(json_request(
                "POST",
                &format!("/orders/{order_id}/cancel"),
                json!({ "reason": "too late" }),
            ))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, json) = t
            .send(json_request(
                "POST",
                &format!("/orders/{order_id}/refund"),
                json!({ "reason": "damaged pack" }),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "REFUNDED");
    }

    #[tokio::test]
    async fn expired_reservation_fails_the_order() {
        let t = setup().stocked().await;
        let order_id = t.pending_order().await;
        let mut events = t.services.bus.subscribe();

        t.clock.advance(Duration::from_secs(601));
        let report = t.services.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.expired, 2);

        let listener = ExpiryListener::new(t.services.state.machine.clone());
        while let Ok(event) = events.try_recv() {
            listener.handle(&event).await.unwrap();
        }

        let json = t.order(&order_id).await;
        assert_eq!(json["status"], "PAYMENT_FAILED");
        assert_eq!(json["failure_reason"], "reservation_expired");
        assert_eq!(t.stock("milk-1l").await["reserved_quantity"], 0);
    }
}

mod payments {
    use super::*;

    #[tokio::test]
    async fn confirm_payment_decrements_stock() {
        let t = setup().stocked().await;
        let order_id = t.pending_order().await;

        let (status, json) = t.pay(&order_id, PaymentOutcome::Captured).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["verdict"], "confirmed");
        assert_eq!(json["status"], "CONFIRMED");

        let milk = t.stock("milk-1l").await;
        assert_eq!(milk["available_quantity"], 3);
        assert_eq!(milk["reserved_quantity"], 0);
    }

    #[tokio::test]
    async fn duplicate_webhook_with_header_signature_is_applied_once() {
        let t = setup().stocked().await;
        let order_id = t.pending_order().await;

        let mut evidence = t.evidence(&order_id, PaymentOutcome::Captured);
        let signature = evidence["signature"].as_str().unwrap().to_string();
        evidence["signature"] = Value::String(String::new());
        evidence["order_id"] = Value::String(order_id.clone());

        for _ in 0..2 {
            let request = Request::builder()
                .method("POST")
                .uri("/webhooks/payment")
                .header("content-type", "application/json")
                .header("x-gateway-signature", &signature)
                .body(Body::from(evidence.to_string()))
                .unwrap();

            let (status, json) = t.send(request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["verdict"], "confirmed");
            assert_eq!(json["status"], "CONFIRMED");
        }

        assert_eq!(t.stock("milk-1l").await["available_quantity"], 3);
        assert_eq!(t.stock("atta-5kg").await["available_quantity"], 2);
    }

    #[tokio::test]
    async fn forged_evidence_fails_and_flags_the_order() {
        let t = setup().stocked().await;
        let order_id = t.pending_order().await;

        let mut evidence = t.evidence(&order_id, PaymentOutcome::Captured);
        evidence["signature"] = Value::String("00".repeat(32));

        let (status, json) = t
            .send(json_request(
                "POST",
                &format!("/orders/{order_id}/payment"),
                evidence,
            ))
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["verdict"], "invalid");
        assert_eq!(json["status"], "PAYMENT_FAILED");

        let order = t.order(&order_id).await;
        assert_eq!(order["flagged_for_fraud"], true);
        assert_eq!(order["failure_reason"], "invalid_signature");
        assert_eq!(t.stock("milk-1l").await["reserved_quantity"], 0);
    }

    #[tokio::test]
    async fn decline_releases_stock() {
        let t = setup().stocked().await;
        let order_id = t.pending_order().await;

        let (status, json) = t
            .pay(
                &order_id,
                PaymentOutcome::Declined {
                    reason: "insufficient_funds".into(),
                },
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["verdict"], "declined");
        assert_eq!(json["status"], "PAYMENT_FAILED");
        assert_eq!(t.stock("atta-5kg").await["reserved_quantity"], 0);
        assert_eq!(t.stock("atta-5kg").await["available_quantity"], 3);
    }

    #[tokio::test]
    async fn webhook_for_unknown_order_is_not_found() {
        let t = setup().stocked().await;
        let order_id = t.pending_order().await;

        let mut evidence = t.evidence(&order_id, PaymentOutcome::Captured);
        evidence["order_id"] = Value::String(Uuid::new_v4().to_string());

        let (status, _) = t
            .send(json_request("POST", "/webhooks/payment", evidence))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
