// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Auth service client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{ClientError, Result};

/// Token owner and lifetime.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenInfo {
    /// User name the token belongs to.
    pub user: String,
    /// Expiry, epoch milliseconds.
    pub expires: i64,
}

impl TokenInfo {
    /// Expiry as a timestamp.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.expires)
    }
}

/// Token validation.
#[async_trait]
pub trait Auth: Send + Sync {
    /// Validate `token` and return its owner and expiry.
    async fn token_info(&self, token: &str) -> Result<TokenInfo>;
}

/// Client for the auth service token endpoint (`/api/V2/token`).
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    url: String,
}

impl AuthClient {
    /// Create a client for the token endpoint at `url`.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Auth for AuthClient {
    async fn token_info(&self, token: &str) -> Result<TokenInfo> {
        let response = self
            .http
            .get(&self.url)
            .header(reqwest::header::AUTHORIZATION, token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}
