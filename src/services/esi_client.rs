//! ESI API client.
//!
//! HTTP client for the EVE Swagger Interface with bearer authentication,
//! header-driven pagination (`X-Pages`) and ETag-based conditional fetching.
//! ETags are persisted per resource locator in the `esi_etags` table so the
//! freshness gate survives restarts.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::character;
use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// ESI client configuration.
#[derive(Debug, Clone)]
pub struct EsiClientConfig {
    /// Base URL of the ESI server.
    pub base_url: String,

    /// OAuth access token for authenticated endpoints.
    pub access_token: Option<String>,

    /// User-Agent header value; ESI requires one identifying the caller.
    pub user_agent: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EsiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://esi.evetech.net".to_string(),
            access_token: None,
            user_agent: "esi-mirror/0.3".to_string(),
            timeout_secs: 30,
        }
    }
}

/// One page of a paginated resource.
///
/// `is_unchanged` reflects whether the upstream reported this exact page as
/// byte-identical to the last successful fetch (HTTP 304 against a stored
/// ETag). An unchanged page carries no records.
#[derive(Debug, Clone)]
pub struct EsiPage<T> {
    /// Records on this page; empty when `is_unchanged`.
    pub records: Vec<T>,

    /// Total number of pages for the resource.
    pub total_pages: u32,

    /// Whether the server answered 304 Not Modified.
    pub is_unchanged: bool,
}

impl<T> EsiPage<T> {
    /// Page result for a 304 response.
    pub fn unchanged(total_pages: u32) -> Self {
        Self {
            records: Vec::new(),
            total_pages,
            is_unchanged: true,
        }
    }
}

/// Result of a conditional single-payload fetch.
#[derive(Debug, Clone)]
pub enum Conditional<T> {
    /// Server returned 304 Not Modified; the stored data is current.
    Unchanged,
    /// Server returned a fresh payload.
    Fresh(T),
}

impl<T> Conditional<T> {
    /// Returns true for the 304 case.
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Conditional::Unchanged)
    }

    /// Extract the payload if fresh.
    pub fn into_fresh(self) -> Option<T> {
        match self {
            Conditional::Unchanged => None,
            Conditional::Fresh(data) => Some(data),
        }
    }
}

/// Asset record from `GET /characters/{id}/assets/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterAssetDto {
    pub item_id: i64,
    pub type_id: i64,
    pub quantity: i64,
    pub location_id: i64,
    pub location_flag: String,
    pub location_type: String,
    pub is_singleton: bool,
}

/// Killmail payload from `GET /killmails/{id}/{hash}/`.
#[derive(Debug, Clone, Deserialize)]
pub struct KillmailDto {
    pub killmail_time: String,
    pub solar_system_id: i64,
    pub moon_id: Option<i64>,
    pub war_id: Option<i64>,
    pub victim: KillmailVictimDto,
    pub attackers: Vec<KillmailAttackerDto>,
}

/// Victim block of a killmail payload. Identity fields are absent for
/// anonymized victims.
#[derive(Debug, Clone, Deserialize)]
pub struct KillmailVictimDto {
    pub character_id: Option<i64>,
    pub corporation_id: Option<i64>,
    pub alliance_id: Option<i64>,
    pub faction_id: Option<i64>,
    pub damage_taken: i64,
    pub ship_type_id: i64,
    pub position: Option<PositionDto>,
    pub items: Option<Vec<VictimItemDto>>,
}

/// 3D coordinates of the victim wreck.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PositionDto {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One attacker block. `damage_done`, `final_blow` and `security_status`
/// are required upstream; a payload lacking them fails deserialization and
/// aborts the sync unit.
#[derive(Debug, Clone, Deserialize)]
pub struct KillmailAttackerDto {
    pub character_id: Option<i64>,
    pub corporation_id: Option<i64>,
    pub alliance_id: Option<i64>,
    pub faction_id: Option<i64>,
    pub security_status: f64,
    pub final_blow: bool,
    pub damage_done: i64,
    pub ship_type_id: Option<i64>,
    pub weapon_type_id: Option<i64>,
}

/// One dropped/destroyed item on the victim ship.
#[derive(Debug, Clone, Deserialize)]
pub struct VictimItemDto {
    pub item_type_id: i64,
    pub flag: i64,
    pub singleton: i64,
    pub quantity_destroyed: Option<i64>,
    pub quantity_dropped: Option<i64>,
}

/// Fetch collaborator used by the sync services.
///
/// The sync loops depend on this trait rather than on `EsiClient` directly
/// so tests can drive them with scripted pages.
#[async_trait]
pub trait EsiFetch: Send + Sync {
    /// Fetch one page of a character's asset collection.
    ///
    /// `conditional` controls whether a stored ETag is sent; the asset loop
    /// only passes true for page 1 so later pages always carry records.
    async fn fetch_assets_page(
        &self,
        character_id: i64,
        page: u32,
        conditional: bool,
    ) -> Result<EsiPage<CharacterAssetDto>, AppError>;

    /// Fetch a full killmail payload (single fetch, no pagination).
    async fn fetch_killmail(
        &self,
        killmail_id: i64,
        killmail_hash: &str,
    ) -> Result<Conditional<KillmailDto>, AppError>;
}

/// ESI API client.
#[derive(Debug, Clone)]
pub struct EsiClient {
    client: Client,
    config: EsiClientConfig,
    pool: DbPool,
}

impl EsiClient {
    /// Create a new ESI client backed by the given database for ETag storage.
    pub fn new(config: EsiClientConfig, pool: DbPool) -> Result<Self, AppError> {
        let mut headers = header::HeaderMap::new();

        let ua_value = header::HeaderValue::from_str(&config.user_agent)
            .map_err(|_| AppError::invalid_input("Invalid user agent"))?;
        headers.insert(header::USER_AGENT, ua_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            pool,
        })
    }

    /// Build the full URL for an API request.
    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/latest{}",
            self.config.base_url.trim_end_matches('/'),
            path
        )
    }

    /// Total page count from the `X-Pages` response header.
    fn parse_total_pages(response: &Response) -> u32 {
        response
            .headers()
            .get("x-pages")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(1)
    }

    /// Stored ETag for a resource locator, if any.
    async fn get_etag(&self, resource: &str) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT etag FROM esi_etags WHERE resource = ?")
                .bind(resource)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(etag,)| etag))
    }

    /// Persist the ETag returned with a fresh payload.
    async fn store_etag(&self, resource: &str, etag: &str) -> Result<(), AppError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        sqlx::query(
            "INSERT INTO esi_etags (resource, etag, fetched_at) VALUES (?, ?, ?)
             ON CONFLICT(resource) DO UPDATE SET
               etag = excluded.etag,
               fetched_at = excluded.fetched_at",
        )
        .bind(resource)
        .bind(etag)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Handle API response errors.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: Response,
        endpoint: &str,
    ) -> Result<T, AppError> {
        let status = response.status();

        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|e| AppError::internal(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::UNAUTHORIZED {
            // 401 Unauthorized - token is expired or revoked
            Err(AppError::authentication_expired(
                "ESI token expired or revoked. Please re-authenticate.",
            ))
        } else {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let body_message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| {
                    // ESI returns errors as {"error": "..."}
                    v.get("error").and_then(|m| m.as_str()).map(String::from)
                });

            let message = match (status, &body_message) {
                (StatusCode::FORBIDDEN, _) => "Access denied".to_string(),
                (StatusCode::NOT_FOUND, _) => "Resource not found".to_string(),
                (StatusCode::TOO_MANY_REQUESTS, _) => "Rate limit exceeded".to_string(),
                (_, Some(msg)) if status_code == 420 => {
                    format!("ESI error limited: {}", msg)
                }
                (_, Some(msg)) => msg.clone(),
                _ => format!("Request failed ({}): {}", status_code, body),
            };

            Err(AppError::esi_api_full(&message, status_code, endpoint))
        }
    }

    /// Access token for a character's authenticated endpoints.
    ///
    /// Prefers the token stored with the tracked character, falling back
    /// to the client-wide token.
    async fn character_token(&self, character_id: i64) -> Result<Option<String>, AppError> {
        let stored = character::get_character(&self.pool, character_id)
            .await?
            .and_then(|c| c.access_token);

        Ok(stored.or_else(|| self.config.access_token.clone()))
    }

    /// Make a conditional GET request against an endpoint.
    ///
    /// Sends `If-None-Match` when `conditional` is set and an ETag is stored
    /// for `resource`. Returns the raw response so callers can branch on 304
    /// before parsing; a fresh ETag is persisted afterwards.
    async fn get_conditional(
        &self,
        url: &str,
        resource: &str,
        page: Option<u32>,
        conditional: bool,
        token: Option<&str>,
    ) -> Result<Response, AppError> {
        let mut request = self.client.get(url);

        if let Some(page) = page {
            request = request.query(&[("page", page.to_string())]);
        }

        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        if conditional {
            if let Some(etag) = self.get_etag(resource).await? {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
        }

        Ok(request.send().await?)
    }

    /// ETag from a fresh response, if the server sent one.
    fn response_etag(response: &Response) -> Option<String> {
        response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

#[async_trait]
impl EsiFetch for EsiClient {
    async fn fetch_assets_page(
        &self,
        character_id: i64,
        page: u32,
        conditional: bool,
    ) -> Result<EsiPage<CharacterAssetDto>, AppError> {
        let endpoint = format!("/characters/{}/assets/", character_id);
        let url = self.api_url(&endpoint);
        let resource = format!("{}?page={}", endpoint, page);
        let token = self.character_token(character_id).await?;

        let response = self
            .get_conditional(&url, &resource, Some(page), conditional, token.as_deref())
            .await?;

        let total_pages = Self::parse_total_pages(&response);

        if response.status() == StatusCode::NOT_MODIFIED {
            log::debug!(
                "assets page {} for character {} unchanged",
                page,
                character_id
            );
            return Ok(EsiPage::unchanged(total_pages));
        }

        let etag = Self::response_etag(&response);
        let records = self
            .handle_response::<Vec<CharacterAssetDto>>(response, &endpoint)
            .await?;

        if let Some(etag) = etag {
            self.store_etag(&resource, &etag).await?;
        }

        Ok(EsiPage {
            records,
            total_pages,
            is_unchanged: false,
        })
    }

    async fn fetch_killmail(
        &self,
        killmail_id: i64,
        killmail_hash: &str,
    ) -> Result<Conditional<KillmailDto>, AppError> {
        let endpoint = format!("/killmails/{}/{}/", killmail_id, killmail_hash);
        let url = self.api_url(&endpoint);

        let response = self
            .get_conditional(
                &url,
                &endpoint,
                None,
                true,
                self.config.access_token.as_deref(),
            )
            .await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            log::debug!("killmail {} unchanged", killmail_id);
            return Ok(Conditional::Unchanged);
        }

        let etag = Self::response_etag(&response);
        let detail = self
            .handle_response::<KillmailDto>(response, &endpoint)
            .await?;

        if let Some(etag) = etag {
            self.store_etag(&endpoint, &etag).await?;
        }

        Ok(Conditional::Fresh(detail))
    }
}
