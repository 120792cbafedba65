use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha512};
use url::Url;

/// Prefix of every order id sent to the gateway.
pub const ORDER_PREFIX: &str = "BOOK-";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed gateway response: {0}")]
    Malformed(String),

    #[error("invalid callback url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone)]
pub struct CustomerDetails {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LineItem {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
pub struct CallbackUrls {
    pub finish: String,
    pub error: String,
    pub pending: String,
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub order_id: String,
    pub amount: i64,
    pub customer: CustomerDetails,
    pub items: Vec<LineItem>,
    pub callbacks: CallbackUrls,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentSession {
    pub token: String,
    pub redirect_url: String,
}

/// Result of a status query. `NotFound` is conclusive: the gateway has no
/// transaction for the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Found {
        transaction_status: String,
        fraud_status: Option<String>,
    },
    NotFound,
}

/// What a gateway status means for a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEvent {
    Settled,
    Pending,
    Failed,
    Expired,
    Ignored,
}

pub fn classify(transaction_status: &str, fraud_status: Option<&str>) -> PaymentEvent {
    match (transaction_status, fraud_status) {
        ("settlement", None | Some("accept")) => PaymentEvent::Settled,
        ("capture", None | Some("accept")) => PaymentEvent::Settled,
        ("capture", Some("challenge")) | ("pending", _) => PaymentEvent::Pending,
        ("deny", _) | ("cancel", _) => PaymentEvent::Failed,
        ("expire", _) => PaymentEvent::Expired,
        _ => PaymentEvent::Ignored,
    }
}

pub fn order_id_for(booking_id: &str) -> String {
    format!("{ORDER_PREFIX}{booking_id}")
}

/// Callback targets on the customer frontend for one booking.
pub fn callback_urls(frontend_url: &str, booking_id: &str) -> Result<CallbackUrls, url::ParseError> {
    let base = Url::parse(frontend_url)?;
    let build = |outcome: &str| -> Result<String, url::ParseError> {
        let mut url = base.join(&format!("bookings/{booking_id}"))?;
        url.query_pairs_mut().append_pair("payment", outcome);
        Ok(url.to_string())
    };
    Ok(CallbackUrls {
        finish: build("finish")?,
        error: build("error")?,
        pending: build("pending")?,
    })
}

/// Check the `signature_key` of an inbound notification:
/// hex SHA-512 of `order_id + status_code + gross_amount + server_key`.
pub fn verify_signature(
    server_key: &str,
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    signature: &str,
) -> bool {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    let expected = hex::encode(hasher.finalize());
    expected.eq_ignore_ascii_case(signature)
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_session(&self, request: &SessionRequest) -> Result<PaymentSession, GatewayError>;

    async fn query_status(&self, order_id: &str) -> Result<GatewayStatus, GatewayError>;
}

/// Midtrans Snap (session creation) and Core API (status query).
pub struct MidtransGateway {
    client: reqwest::Client,
    server_key: String,
    snap_url: String,
    api_url: String,
}

impl MidtransGateway {
    pub fn new(server_key: impl Into<String>, snap_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            server_key: server_key.into(),
            snap_url: snap_url.into(),
            api_url: api_url.into(),
        }
    }

    fn session_body(request: &SessionRequest) -> serde_json::Value {
        let items: Vec<serde_json::Value> = request
            .items
            .iter()
            .map(|item| {
                serde_json::json!({
                    "id": item.id,
                    "price": item.price,
                    "quantity": item.quantity,
                    "name": item.name,
                })
            })
            .collect();

        serde_json::json!({
            "transaction_details": {
                "order_id": request.order_id,
                "gross_amount": request.amount,
            },
            "customer_details": {
                "first_name": request.customer.name,
                "email": request.customer.email,
                "phone": request.customer.phone,
            },
            "item_details": items,
            "callbacks": {
                "finish": request.callbacks.finish,
                "error": request.callbacks.error,
                "pending": request.callbacks.pending,
            },
        })
    }
}

#[async_trait]
impl PaymentGateway for MidtransGateway {
    async fn create_session(&self, request: &SessionRequest) -> Result<PaymentSession, GatewayError> {
        let resp = self
            .client
            .post(format!("{}/snap/v1/transactions", self.snap_url.trim_end_matches('/')))
            .basic_auth(&self.server_key, Some(""))
            .header("Accept", "application/json")
            .json(&Self::session_body(request))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(order_id = %request.order_id, status, "Snap session creation failed: {}", body);
            return Err(GatewayError::Rejected { status, body });
        }

        let session: PaymentSession = resp
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;

        tracing::info!(order_id = %request.order_id, "Payment session created");
        Ok(session)
    }

    async fn query_status(&self, order_id: &str) -> Result<GatewayStatus, GatewayError> {
        let resp = self
            .client
            .get(format!("{}/v2/{}/status", self.api_url.trim_end_matches('/'), order_id))
            .basic_auth(&self.server_key, Some(""))
            .header("Accept", "application/json")
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(GatewayStatus::NotFound);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected { status, body });
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        parse_status(&json)
    }
}

/// Core API answers unknown orders with HTTP 200 and `status_code: "404"`.
fn parse_status(json: &serde_json::Value) -> Result<GatewayStatus, GatewayError> {
    if json["status_code"].as_str() == Some("404") {
        return Ok(GatewayStatus::NotFound);
    }
    let transaction_status = json["transaction_status"]
        .as_str()
        .ok_or_else(|| GatewayError::Malformed("missing transaction_status".into()))?
        .to_string();
    let fraud_status = json["fraud_status"].as_str().map(str::to_string);
    Ok(GatewayStatus::Found {
        transaction_status,
        fraud_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_settlement() {
        assert_eq!(classify("settlement", Some("accept")), PaymentEvent::Settled);
        assert_eq!(classify("settlement", None), PaymentEvent::Settled);
        assert_eq!(classify("capture", Some("accept")), PaymentEvent::Settled);
    }

    #[test]
    fn test_classify_non_final() {
        assert_eq!(classify("capture", Some("challenge")), PaymentEvent::Pending);
        assert_eq!(classify("pending", None), PaymentEvent::Pending);
        assert_eq!(classify("refund", None), PaymentEvent::Ignored);
    }

    #[test]
    fn test_classify_failures() {
        assert_eq!(classify("deny", None), PaymentEvent::Failed);
        assert_eq!(classify("cancel", Some("accept")), PaymentEvent::Failed);
        assert_eq!(classify("expire", None), PaymentEvent::Expired);
    }

    #[test]
    fn test_signature_roundtrip() {
        let mut hasher = Sha512::new();
        hasher.update(b"BOOK-1200150000.00secret");
        let sig = hex::encode(hasher.finalize());

        assert!(verify_signature("secret", "BOOK-1", "200", "150000.00", &sig));
        assert!(!verify_signature("other", "BOOK-1", "200", "150000.00", &sig));
        assert!(!verify_signature("secret", "BOOK-1", "201", "150000.00", &sig));
    }

    #[test]
    fn test_callback_urls() {
        let urls = callback_urls("https://shop.example/app/", "abc").unwrap();
        assert_eq!(urls.finish, "https://shop.example/app/bookings/abc?payment=finish");
        assert!(urls.pending.ends_with("payment=pending"));
    }

    #[test]
    fn test_parse_status_not_found_body() {
        let json = serde_json::json!({ "status_code": "404", "status_message": "Transaction doesn't exist." });
        assert_eq!(parse_status(&json).unwrap(), GatewayStatus::NotFound);

        let json = serde_json::json!({ "status_code": "200", "transaction_status": "settlement", "fraud_status": "accept" });
        assert_eq!(
            parse_status(&json).unwrap(),
            GatewayStatus::Found {
                transaction_status: "settlement".into(),
                fraud_status: Some("accept".into()),
            }
        );
    }

    #[test]
    fn test_order_id_prefix() {
        assert_eq!(order_id_for("42"), "BOOK-42");
    }
}
