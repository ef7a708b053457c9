//! Client for the distributor's License Status Documents

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    config::DistributorConfig,
    error::{AppError, AppResult},
    models::{LoanStatus, StatusDocument},
    services::uri_template,
};

/// Parameters of a new remote checkout
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    /// License checkout URI template
    pub template: String,
    pub license_identifier: String,
    pub checkout_id: Uuid,
    /// Fresh per loan so the distributor cannot link a patron's checkouts
    pub patron_correlation_id: Uuid,
    pub expires: DateTime<Utc>,
    pub notification_url: String,
    /// Base64 of the hashed patron passphrase
    pub passphrase: String,
    pub hint: String,
    pub hint_url: String,
}

impl CheckoutRequest {
    /// The expanded checkout URL
    pub fn url(&self) -> String {
        let variables = HashMap::from([
            ("id", self.license_identifier.clone()),
            ("checkout_id", self.checkout_id.to_string()),
            ("patron_id", self.patron_correlation_id.to_string()),
            (
                "expires",
                self.expires.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("notification_url", self.notification_url.clone()),
            ("passphrase", self.passphrase.clone()),
            ("hint", self.hint.clone()),
            ("hint_url", self.hint_url.clone()),
        ]);
        uri_template::expand(&self.template, &variables)
    }
}

/// Which status document to obtain
#[derive(Debug, Clone, PartialEq)]
pub enum StatusRequest {
    /// Re-read the document of a confirmed loan
    Existing { url: String },
    /// Create the remote loan
    Checkout(CheckoutRequest),
}

impl StatusRequest {
    pub fn url(&self) -> String {
        match self {
            StatusRequest::Existing { url } => url.clone(),
            StatusRequest::Checkout(request) => request.url(),
        }
    }
}

/// Remote side of circulation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusDocumentApi: Send + Sync {
    /// GET the status document, creating the remote loan for a checkout request
    async fn fetch_or_create(&self, request: &StatusRequest) -> AppResult<StatusDocument>;

    /// Hit a return link
    async fn request_return(&self, url: &str) -> AppResult<()>;
}

/// The `return` link of a document, if the distributor offers one
pub fn terminate(document: &StatusDocument) -> Option<String> {
    document.link("return").map(|link| link.href.clone())
}

/// Validate and parse a status document body
pub fn parse_status_document(url: &str, body: &[u8]) -> AppResult<StatusDocument> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|_| {
        AppError::bad_response(url, "License Status Document was not valid JSON.")
    })?;

    let status = value.get("status").and_then(|s| s.as_str());
    if status.and_then(LoanStatus::parse).is_none() {
        return Err(AppError::bad_response(
            url,
            "License Status Document had an unknown status value.",
        ));
    }

    serde_json::from_value(value).map_err(|e| {
        AppError::bad_response(url, format!("License Status Document is malformed: {}", e))
    })
}

/// reqwest implementation with basic auth and a bounded timeout
#[derive(Clone)]
pub struct HttpStatusDocumentClient {
    client: reqwest::Client,
    username: String,
    password: String,
}

impl HttpStatusDocumentClient {
    pub fn new(config: &DistributorConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Authenticated GET; anything but 2xx is a bad response
    async fn get(&self, url: &str) -> AppResult<Vec<u8>> {
        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() { "timed out" } else { "request failed" };
                AppError::bad_response(url, format!("Distributor {}: {}", reason, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::bad_response(
                url,
                format!("Got status code {} from distributor", status.as_u16()),
            ));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::bad_response(url, format!("Failed to read body: {}", e)))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl StatusDocumentApi for HttpStatusDocumentClient {
    async fn fetch_or_create(&self, request: &StatusRequest) -> AppResult<StatusDocument> {
        let url = request.url();
        let body = self.get(&url).await?;
        let document = parse_status_document(&url, &body)?;
        tracing::debug!("Status document {} is {}", url, document.status.as_str());
        Ok(document)
    }

    async fn request_return(&self, url: &str) -> AppResult<()> {
        self.get(url).await.map(|_| ())
    }
}
