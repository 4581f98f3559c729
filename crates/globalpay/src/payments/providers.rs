//! HTTP adapters for the external payment providers.
//!
//! Each adapter creates a hosted checkout (payment intent, preference or
//! order) for the charge and returns the provider's reference. Card data never
//! passes through this service.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{ChargeRequest, PaymentProvider, ProviderCharge};
use crate::error::ProviderError;
use crate::money::{price_string, to_smallest_unit, PRICE_DECIMALS};

/// Currencies the providers expect without fractional digits.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &["jpy", "krw", "clp", "vnd"];

/// Longest provider error message carried into logs and attempt records.
const MAX_ERROR_LEN: usize = 200;

/// Authenticated HTTP access to one provider API.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl ProviderClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, ProviderError> {
        if token.trim().is_empty() {
            return Err(ProviderError::Misconfigured("empty API credential".to_string()));
        }
        let parsed = url::Url::parse(base_url)
            .map_err(|e| ProviderError::Misconfigured(format!("invalid base URL: {e}")))?;
        if parsed.scheme() != "https" && parsed.host_str() != Some("localhost") {
            return Err(ProviderError::Misconfigured(
                "provider base URL must use https".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| ProviderError::Misconfigured(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.token)
    }
}

/// Read a provider response body, turning non-2xx statuses into `Rejected`.
async fn read_json(resp: reqwest::Response) -> Result<Value, ProviderError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Rejected {
            status: status.as_u16(),
            message: error_message(&body),
        });
    }
    Ok(resp.json::<Value>().await?)
}

/// Pull a human-readable message out of a provider error body.
fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .or_else(|| v.pointer("/details/0/description"))
                .and_then(Value::as_str)
        })
        .unwrap_or(body);
    message.chars().take(MAX_ERROR_LEN).collect()
}

fn required_str(body: &Value, field: &str) -> Result<String, ProviderError> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::InvalidResponse(format!("missing field {field}")))
}

fn is_zero_decimal(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_lowercase().as_str())
}

fn unpriceable(charge: &ChargeRequest) -> ProviderError {
    ProviderError::Misconfigured(format!("unpriceable amount {}", charge.amount))
}

/// Amount in the provider's smallest currency unit.
fn smallest_unit(charge: &ChargeRequest) -> Result<i64, ProviderError> {
    let decimals = if is_zero_decimal(&charge.currency) { 0 } else { PRICE_DECIMALS };
    to_smallest_unit(charge.amount, decimals).ok_or_else(|| unpriceable(charge))
}

/// Decimal amount string as the provider expects it ("49.90", or "980" for yen).
fn decimal_amount(charge: &ChargeRequest) -> Result<String, ProviderError> {
    if is_zero_decimal(&charge.currency) {
        smallest_unit(charge).map(|units| units.to_string())
    } else {
        Ok(price_string(charge.amount))
    }
}

/// Stripe payment intents.
#[derive(Debug, Clone)]
pub struct StripeProvider {
    client: ProviderClient,
}

impl StripeProvider {
    pub const NAME: &'static str = "stripe";
    pub const DEFAULT_URL: &'static str = "https://api.stripe.com";

    pub fn new(client: ProviderClient) -> Self {
        Self { client }
    }

    fn form(charge: &ChargeRequest) -> Result<Vec<(&'static str, String)>, ProviderError> {
        Ok(vec![
            ("amount", smallest_unit(charge)?.to_string()),
            ("currency", charge.currency.to_ascii_lowercase()),
            ("receipt_email", charge.email.clone()),
            ("description", charge.description()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            ("metadata[payment_id]", charge.payment_id.clone()),
            ("metadata[plan]", charge.plan.clone()),
            ("metadata[country]", charge.country.clone()),
        ])
    }

    fn parse(body: &Value) -> Result<ProviderCharge, ProviderError> {
        Ok(ProviderCharge {
            provider_reference: required_str(body, "id")?,
            status: required_str(body, "status")?,
            checkout_url: None,
        })
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn charge(&self, charge: &ChargeRequest) -> Result<ProviderCharge, ProviderError> {
        let resp = self
            .client
            .post("/v1/payment_intents")
            .header("Idempotency-Key", &charge.payment_id)
            .form(&Self::form(charge)?)
            .send()
            .await?;
        Self::parse(&read_json(resp).await?)
    }
}

/// MercadoPago checkout preferences.
#[derive(Debug, Clone)]
pub struct MercadoPagoProvider {
    client: ProviderClient,
}

impl MercadoPagoProvider {
    pub const NAME: &'static str = "mercadopago";
    pub const DEFAULT_URL: &'static str = "https://api.mercadopago.com";

    pub fn new(client: ProviderClient) -> Self {
        Self { client }
    }

    fn body(charge: &ChargeRequest) -> Result<Value, ProviderError> {
        // The API takes the unit price as a JSON number.
        let unit_price: serde_json::Number = decimal_amount(charge)?
            .parse()
            .map_err(|_| unpriceable(charge))?;

        let mut payer = json!({ "email": charge.email, "name": charge.payer_name });
        if let Some(document) = &charge.payer_document {
            let digits: String = document.chars().filter(char::is_ascii_digit).collect();
            let kind = if digits.len() > 11 { "CNPJ" } else { "CPF" };
            payer["identification"] = json!({ "type": kind, "number": digits });
        }

        Ok(json!({
            "items": [{
                "id": charge.plan,
                "title": charge.description(),
                "quantity": 1,
                "currency_id": charge.currency.to_ascii_uppercase(),
                "unit_price": unit_price,
            }],
            "payer": payer,
            "external_reference": charge.payment_id,
        }))
    }

    fn parse(body: &Value) -> Result<ProviderCharge, ProviderError> {
        let reference = match body.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(ProviderError::InvalidResponse("missing field id".to_string())),
        };
        Ok(ProviderCharge {
            provider_reference: reference,
            status: "pending".to_string(),
            checkout_url: Some(required_str(body, "init_point")?),
        })
    }
}

#[async_trait]
impl PaymentProvider for MercadoPagoProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn charge(&self, charge: &ChargeRequest) -> Result<ProviderCharge, ProviderError> {
        let resp = self
            .client
            .post("/checkout/preferences")
            .header("X-Idempotency-Key", &charge.payment_id)
            .json(&Self::body(charge)?)
            .send()
            .await?;
        Self::parse(&read_json(resp).await?)
    }
}

/// PayPal orders.
#[derive(Debug, Clone)]
pub struct PayPalProvider {
    client: ProviderClient,
}

impl PayPalProvider {
    pub const NAME: &'static str = "paypal";
    pub const DEFAULT_URL: &'static str = "https://api-m.paypal.com";

    pub fn new(client: ProviderClient) -> Self {
        Self { client }
    }

    fn body(charge: &ChargeRequest) -> Result<Value, ProviderError> {
        Ok(json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": charge.payment_id,
                "description": charge.description(),
                "amount": {
                    "currency_code": charge.currency.to_ascii_uppercase(),
                    "value": decimal_amount(charge)?,
                },
            }],
        }))
    }

    fn parse(body: &Value) -> Result<ProviderCharge, ProviderError> {
        let approve = body
            .get("links")
            .and_then(Value::as_array)
            .and_then(|links| {
                links.iter().find(|l| {
                    matches!(l.get("rel").and_then(Value::as_str), Some("approve" | "payer-action"))
                })
            })
            .and_then(|l| l.get("href"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(ProviderCharge {
            provider_reference: required_str(body, "id")?,
            status: required_str(body, "status")?.to_ascii_lowercase(),
            checkout_url: approve,
        })
    }
}

#[async_trait]
impl PaymentProvider for PayPalProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn charge(&self, charge: &ChargeRequest) -> Result<ProviderCharge, ProviderError> {
        let resp = self
            .client
            .post("/v2/checkout/orders")
            .header("PayPal-Request-Id", &charge.payment_id)
            .json(&Self::body(charge)?)
            .send()
            .await?;
        Self::parse(&read_json(resp).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn charge(currency: &str, amount: &str) -> ChargeRequest {
        ChargeRequest {
            payment_id: "pay_abc".into(),
            plan: "mensal".into(),
            amount: Decimal::from_str_exact(amount).unwrap(),
            currency: currency.into(),
            country: "BR".into(),
            region_id: "sa-east-1".into(),
            email: "maria@example.com.br".into(),
            payer_name: "Maria Silva".into(),
            payer_document: Some("123.456.789-09".into()),
        }
    }

    #[test]
    fn test_stripe_form_uses_smallest_unit() {
        let form = StripeProvider::form(&charge("brl", "49.90")).unwrap();
        assert!(form.contains(&("amount", "4990".to_string())));
        assert!(form.contains(&("currency", "brl".to_string())));
        assert!(form.contains(&("metadata[payment_id]", "pay_abc".to_string())));

        let form = StripeProvider::form(&charge("jpy", "980.00")).unwrap();
        assert!(form.contains(&("amount", "980".to_string())));

        assert!(matches!(
            StripeProvider::form(&charge("usd", "79228162514264337593543950")),
            Err(ProviderError::Misconfigured(_))
        ));
    }

    #[test]
    fn test_mercadopago_body() {
        let body = MercadoPagoProvider::body(&charge("brl", "49.90")).unwrap();
        assert_eq!(body["items"][0]["currency_id"], "BRL");
        assert_eq!(body["items"][0]["unit_price"].to_string(), "49.9");
        assert_eq!(body["external_reference"], "pay_abc");
        assert_eq!(body["payer"]["identification"]["type"], "CPF");
        assert_eq!(body["payer"]["identification"]["number"], "12345678909");
    }

    #[test]
    fn test_paypal_body() {
        let body = PayPalProvider::body(&charge("usd", "9.99")).unwrap();
        assert_eq!(body["purchase_units"][0]["amount"]["value"], "9.99");
        assert_eq!(body["purchase_units"][0]["amount"]["currency_code"], "USD");
        assert_eq!(body["purchase_units"][0]["reference_id"], "pay_abc");
    }

    #[test]
    fn test_parse_provider_responses() {
        let stripe = StripeProvider::parse(&json!({"id": "pi_1", "status": "requires_payment_method"})).unwrap();
        assert_eq!(stripe.provider_reference, "pi_1");

        let mp = MercadoPagoProvider::parse(&json!({
            "id": "123-abc",
            "init_point": "https://www.mercadopago.com.br/checkout/v1/redirect?pref_id=123-abc"
        }))
        .unwrap();
        assert!(mp.checkout_url.unwrap().contains("pref_id"));

        let pp = PayPalProvider::parse(&json!({
            "id": "5O190127TN364715T",
            "status": "PAYER_ACTION_REQUIRED",
            "links": [
                {"href": "https://api-m.paypal.com/v2/checkout/orders/5O1", "rel": "self"},
                {"href": "https://www.paypal.com/checkoutnow?token=5O1", "rel": "payer-action"}
            ]
        }))
        .unwrap();
        assert_eq!(pp.status, "payer_action_required");
        assert_eq!(pp.checkout_url.as_deref(), Some("https://www.paypal.com/checkoutnow?token=5O1"));

        assert!(matches!(
            StripeProvider::parse(&json!({"status": "ok"})),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error":{"message":"Your card was declined."}}"#),
            "Your card was declined."
        );
        assert_eq!(error_message(r#"{"message":"invalid token"}"#), "invalid token");
        assert_eq!(error_message(&"x".repeat(500)).len(), MAX_ERROR_LEN);
    }

    #[test]
    fn test_client_rejects_bad_configuration() {
        let timeout = Duration::from_secs(5);
        assert!(ProviderClient::new("https://api.stripe.com", "", timeout).is_err());
        assert!(ProviderClient::new("http://api.stripe.com", "sk_test", timeout).is_err());
        assert!(ProviderClient::new("not a url", "sk_test", timeout).is_err());
        let client = ProviderClient::new("https://api.stripe.com/", "sk_test", timeout).unwrap();
        assert_eq!(client.url("/v1/payment_intents"), "https://api.stripe.com/v1/payment_intents");
        assert!(!format!("{client:?}").contains("sk_test"));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_transport_error() {
        // Port 9 on localhost: nothing listens, connection is refused
        let client = ProviderClient::new("http://localhost:9", "sk_test", Duration::from_secs(2)).unwrap();
        let stripe = StripeProvider::new(client);
        let err = stripe.charge(&charge("usd", "9.99")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_) | ProviderError::Timeout(_)));
    }
}
