//! Payment submission against the billing backend.
//!
//! [`BillingClient`] turns an accepted payment requirement plus a
//! caller-supplied [`PaymentWitness`] into a verified tool invocation: one
//! `POST ./invoke` with the witness carried out-of-band in the `X-Payment`
//! header, and the invocation `{method, params}` as the body. It also serves
//! the `GET ./status` endpoint used to seed spend totals on startup.
//!
//! No retries happen at this layer: transient and permanent failures are
//! indistinguishable here and must not be conflated with silent success.
//! Retry policy belongs to the coordinator, and its default is "do not".

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use http::{HeaderMap, HeaderValue, StatusCode};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::types::{InvokeReceipt, StatusResponse, ToolInvocation};
use crate::wallet::PaymentWitness;

/// Header carrying the base64-encoded payment witness.
pub const PAYMENT_HEADER: &str = "X-Payment";
/// Header carrying the user identity.
pub const IDENTITY_HEADER: &str = "X-User-Id";
/// Response header some backends use to return the settlement transaction.
pub const PAYMENT_TRANSACTION_HEADER: &str = "X-Payment-Transaction";

/// Errors that can occur while submitting payments to the billing backend.
#[derive(Debug, thiserror::Error)]
pub enum BillingClientError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    /// The verification endpoint answered non-2xx: the payment was rejected.
    #[error("verification rejected ({status}): {reason}")]
    Rejected { status: StatusCode, reason: String },
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to read response body: {context}: {source}")]
    ResponseBodyRead {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to encode payment witness to json")]
    WitnessEncode(#[source] serde_json::Error),
    #[error("Failed to encode payment witness to HTTP header")]
    HeaderValueEncode(#[source] http::header::InvalidHeaderValue),
}

/// A client for the billing backend's verification and status endpoints.
///
/// Handles `POST ./invoke` and `GET ./status` via JSON HTTP.
#[derive(Clone, Debug)]
pub struct BillingClient {
    /// Base URL of the billing backend (e.g. `https://billing.example/`)
    base_url: Url,
    /// Full URL for `POST /invoke` requests
    invoke_url: Url,
    /// Full URL for `GET /status` requests
    status_url: Url,
    /// Shared Reqwest HTTP client
    client: Client,
    /// Optional custom headers sent with each request
    headers: HeaderMap,
    /// Optional request timeout
    timeout: Option<Duration>,
}

impl BillingClient {
    /// Constructs a new [`BillingClient`] from a base URL.
    ///
    /// This sets up the `./invoke` and `./status` endpoint URLs relative to
    /// the base.
    pub fn try_new(base_url: Url) -> Result<Self, BillingClientError> {
        let client = Client::new();
        let invoke_url = base_url
            .join("./invoke")
            .map_err(|e| BillingClientError::UrlParse {
                context: "Failed to construct ./invoke URL",
                source: e,
            })?;
        let status_url = base_url
            .join("./status")
            .map_err(|e| BillingClientError::UrlParse {
                context: "Failed to construct ./status URL",
                source: e,
            })?;
        Ok(Self {
            client,
            base_url,
            invoke_url,
            status_url,
            headers: HeaderMap::new(),
            timeout: None,
        })
    }

    /// Returns the base URL used by this client.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Attaches custom headers to all future requests.
    pub fn with_headers(&self, headers: HeaderMap) -> Self {
        let mut this = self.clone();
        this.headers = headers;
        this
    }

    /// Sets a timeout for all future requests.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.timeout = Some(timeout);
        this
    }

    /// Encodes a witness into the base64 value of the `X-Payment` header.
    pub fn witness_header(witness: &PaymentWitness) -> Result<HeaderValue, BillingClientError> {
        let json = serde_json::to_vec(witness).map_err(BillingClientError::WitnessEncode)?;
        let encoded = b64.encode(json);
        HeaderValue::from_str(&encoded).map_err(BillingClientError::HeaderValueEncode)
    }

    /// Submits one paid tool invocation for verification.
    ///
    /// 2xx means the submission was accepted; the receipt is parsed leniently
    /// (an empty or non-JSON body is fine, and a settlement transaction may
    /// arrive via the `X-Payment-Transaction` header instead). Anything else
    /// is a [`BillingClientError::Rejected`] carrying a human-readable
    /// reason. Exactly one network call, no retries.
    #[instrument(name = "x402.billing_client.invoke", skip_all, fields(method = %invocation.method))]
    pub async fn invoke(
        &self,
        user_id: &str,
        witness: &PaymentWitness,
        invocation: &ToolInvocation,
    ) -> Result<InvokeReceipt, BillingClientError> {
        let payment_header = Self::witness_header(witness)?;
        let mut req = self
            .client
            .post(self.invoke_url.clone())
            .json(invocation)
            .header(PAYMENT_HEADER, payment_header)
            .header(IDENTITY_HEADER, user_id);
        for (key, value) in self.headers.iter() {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let response = req.send().await.map_err(|e| BillingClientError::Http {
            context: "POST /invoke",
            source: e,
        })?;

        let status = response.status();
        if status.is_success() {
            let header_tx = response
                .headers()
                .get(PAYMENT_TRANSACTION_HEADER)
                .and_then(|h| h.to_str().ok())
                .map(ToOwned::to_owned);
            let bytes =
                response
                    .bytes()
                    .await
                    .map_err(|e| BillingClientError::ResponseBodyRead {
                        context: "POST /invoke",
                        source: e,
                    })?;
            let mut receipt = serde_json::from_slice::<InvokeReceipt>(&bytes).unwrap_or_default();
            if receipt.transaction_hash.is_none() {
                receipt.transaction_hash = header_tx;
            }
            #[cfg(feature = "telemetry")]
            tracing::debug!(?receipt, "invoke accepted");
            Ok(receipt)
        } else {
            let reason = rejection_reason(response).await?;
            Err(BillingClientError::Rejected { status, reason })
        }
    }

    /// Fetches the session's billing status.
    #[instrument(name = "x402.billing_client.status", skip_all)]
    pub async fn status(&self, user_id: &str) -> Result<StatusResponse, BillingClientError> {
        let mut req = self
            .client
            .get(self.status_url.clone())
            .header(IDENTITY_HEADER, user_id);
        for (key, value) in self.headers.iter() {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let response = req.send().await.map_err(|e| BillingClientError::Http {
            context: "GET /status",
            source: e,
        })?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<StatusResponse>()
                .await
                .map_err(|e| BillingClientError::JsonDeserialization {
                    context: "GET /status",
                    source: e,
                })
        } else {
            let reason = rejection_reason(response).await?;
            Err(BillingClientError::Rejected { status, reason })
        }
    }
}

/// Extracts a human-readable rejection reason from a non-2xx response:
/// the `error` field of a JSON body when present, the raw body otherwise.
async fn rejection_reason(response: reqwest::Response) -> Result<String, BillingClientError> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }
    let body = response
        .text()
        .await
        .map_err(|e| BillingClientError::ResponseBodyRead {
            context: "error body",
            source: e,
        })?;
    let reason = serde_json::from_str::<ErrorBody>(&body)
        .map(|parsed| parsed.error)
        .unwrap_or(body);
    if reason.is_empty() {
        Ok("payment verification rejected".to_string())
    } else {
        Ok(reason)
    }
}

/// Converts a string URL into a `BillingClient`, parsing the URL and calling `try_new`.
impl TryFrom<&str> for BillingClient {
    type Error = BillingClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        // Normalize: strip trailing slashes and add a single trailing slash
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| BillingClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        BillingClient::try_new(url)
    }
}
