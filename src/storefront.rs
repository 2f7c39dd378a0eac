//! Storefront-side discount codes, created when an affiliate is approved.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("storefront request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storefront returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("discount provisioning is not configured")]
    NotConfigured,
}

#[async_trait]
pub trait DiscountProvisioner: Send + Sync {
    /// Creates `code` on the storefront giving `customer_discount` off, and
    /// returns the code as the storefront stored it.
    async fn create_discount_code(
        &self,
        code: &str,
        customer_discount: Decimal,
    ) -> Result<String, ProvisionError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledProvisioner;

#[async_trait]
impl DiscountProvisioner for DisabledProvisioner {
    async fn create_discount_code(&self, _code: &str, _discount: Decimal) -> Result<String, ProvisionError> {
        Err(ProvisionError::NotConfigured)
    }
}

#[derive(Deserialize)]
struct PriceRuleResponse {
    price_rule: PriceRule,
}

#[derive(Deserialize)]
struct PriceRule {
    id: u64,
}

#[derive(Deserialize)]
struct DiscountCodeResponse {
    discount_code: DiscountCode,
}

#[derive(Deserialize)]
struct DiscountCode {
    code: String,
}

/// Admin-API client creating a price rule and a code under it.
pub struct HttpDiscountProvisioner {
    client: reqwest::Client,
    api_url: String,
    access_token: String,
}

impl HttpDiscountProvisioner {
    pub fn new(api_url: &str, access_token: &str, timeout: Duration) -> Result<Self, ProvisionError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            api_url: api_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ProvisionError> {
        let resp = self
            .client
            .post(format!("{}{}", self.api_url, path))
            .header("X-Storefront-Access-Token", &self.access_token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProvisionError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl DiscountProvisioner for HttpDiscountProvisioner {
    async fn create_discount_code(
        &self,
        code: &str,
        customer_discount: Decimal,
    ) -> Result<String, ProvisionError> {
        let percent = (customer_discount * Decimal::ONE_HUNDRED).normalize();
        let rule: PriceRuleResponse = self
            .post(
                "/price_rules.json",
                json!({
                    "price_rule": {
                        "title": code,
                        "target_type": "line_item",
                        "target_selection": "all",
                        "allocation_method": "across",
                        "value_type": "percentage",
                        "value": format!("-{percent}"),
                        "customer_selection": "all",
                        "starts_at": chrono::Utc::now().to_rfc3339(),
                    }
                }),
            )
            .await?;

        let created: DiscountCodeResponse = self
            .post(
                &format!("/price_rules/{}/discount_codes.json", rule.price_rule.id),
                json!({ "discount_code": { "code": code } }),
            )
            .await?;
        Ok(created.discount_code.code)
    }
}
