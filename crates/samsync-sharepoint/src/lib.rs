//! Microsoft Graph / SharePoint REST destination client.
//!
//! List-item CRUD goes through Graph; attachments go through the SharePoint
//! REST API because Graph does not support list-item attachments. The two
//! surfaces authenticate with different scopes, so the token provider is
//! keyed by scope.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use samsync_core::{Destination, ItemRef, RecordFields, SyncError};
use samsync_http::HttpClient;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "samsync-sharepoint";

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Capability seam for bearer-token acquisition. Caching and refresh are the
/// provider's concern; callers just ask for a token per scope.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self, scope: &str) -> Result<String>;
}

/// Fixed token for tests and local experiments.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self, _scope: &str) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone)]
pub struct AzureAdConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// OAuth2 client-credentials provider with a per-scope token cache.
pub struct ClientCredentialsTokenProvider {
    config: AzureAdConfig,
    http: HttpClient,
    cache: Mutex<HashMap<String, CachedToken>>,
}

// Refresh tokens a minute before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

impl ClientCredentialsTokenProvider {
    pub fn new(config: AzureAdConfig, http: HttpClient) -> Self {
        Self {
            config,
            http,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn token_url(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.config.tenant_id
        )
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokenProvider {
    async fn bearer_token(&self, scope: &str) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(scope) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value.clone());
            }
        }

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", scope),
        ];
        let response: TokenResponse = self
            .http
            .post_form(&self.token_url(), &form)
            .await
            .with_context(|| format!("acquiring token for scope {scope}"))?;

        debug!(scope, expires_in = response.expires_in, "acquired bearer token");
        let lifetime = Duration::from_secs(response.expires_in)
            .saturating_sub(TOKEN_EXPIRY_MARGIN);
        cache.insert(
            scope.to_string(),
            CachedToken {
                value: response.access_token.clone(),
                expires_at: Instant::now() + lifetime,
            },
        );
        Ok(response.access_token)
    }
}

/// Split a site URL like `https://tenant.sharepoint.com/sites/procurement`
/// into the hostname and the server-relative path.
pub fn parse_site_url(site_url: &str) -> Result<(String, String)> {
    let stripped = site_url
        .strip_prefix("https://")
        .or_else(|| site_url.strip_prefix("http://"))
        .unwrap_or(site_url)
        .trim_end_matches('/');

    let mut parts = stripped.splitn(2, '/');
    let hostname = parts.next().unwrap_or_default();
    if hostname.is_empty() {
        bail!("site url {site_url:?} has no hostname");
    }
    let relative = match parts.next() {
        Some(rest) if !rest.is_empty() => format!("/{rest}"),
        _ => String::new(),
    };
    Ok((hostname.to_string(), relative))
}

#[derive(Debug, Clone)]
pub struct SharePointConfig {
    pub site_url: String,
    pub list_name: String,
}

#[derive(Debug, Deserialize)]
struct SiteResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListsResponse {
    #[serde(default)]
    value: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEntry {
    id: String,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(default)]
    value: Vec<ListItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    #[serde(default)]
    fields: serde_json::Map<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct CreatedItem {
    id: JsonValue,
}

pub struct SharePointClient {
    config: SharePointConfig,
    http: HttpClient,
    tokens: Arc<dyn TokenProvider>,
    hostname: String,
    site_path: String,
    site_id: Mutex<Option<String>>,
    list_id: Mutex<Option<String>>,
}

impl SharePointClient {
    pub fn new(
        config: SharePointConfig,
        http: HttpClient,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let (hostname, site_path) = parse_site_url(&config.site_url)?;
        Ok(Self {
            config,
            http,
            tokens,
            hostname,
            site_path,
            site_id: Mutex::new(None),
            list_id: Mutex::new(None),
        })
    }

    /// Scope for the SharePoint REST surface (attachments).
    fn rest_scope(&self) -> String {
        format!("https://{}/.default", self.hostname)
    }

    async fn graph_token(&self) -> Result<String> {
        self.tokens.bearer_token(GRAPH_SCOPE).await
    }

    async fn site_id(&self) -> Result<String> {
        let mut cached = self.site_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let token = self.graph_token().await?;
        let url = format!(
            "{GRAPH_BASE_URL}/sites/{}:{}",
            self.hostname, self.site_path
        );
        let site: SiteResponse = self
            .http
            .get_json(&url, &[], Some(&token))
            .await
            .with_context(|| format!("resolving site id for {}", self.config.site_url))?;

        info!(site_id = %site.id, "resolved destination site");
        *cached = Some(site.id.clone());
        Ok(site.id)
    }

    async fn list_id(&self) -> Result<String> {
        let mut cached = self.list_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let site_id = self.site_id().await?;
        let token = self.graph_token().await?;
        let url = format!("{GRAPH_BASE_URL}/sites/{site_id}/lists");
        let lists: ListsResponse = self
            .http
            .get_json(&url, &[], Some(&token))
            .await
            .context("listing destination site lists")?;

        let Some(entry) = lists
            .value
            .into_iter()
            .find(|list| list.display_name == self.config.list_name)
        else {
            bail!("list {:?} not found in destination site", self.config.list_name);
        };

        info!(list_id = %entry.id, list = %self.config.list_name, "resolved destination list");
        *cached = Some(entry.id.clone());
        Ok(entry.id)
    }

    /// Resolve site and list up front; used by the auth-check command.
    pub async fn verify_access(&self) -> Result<(String, String)> {
        let site_id = self.site_id().await?;
        let list_id = self.list_id().await?;
        Ok((site_id, list_id))
    }

    fn attachment_url(&self, item_id: &str, filename: &str) -> String {
        format!(
            "https://{}{}/_api/web/lists/getbytitle('{}')/items({})/AttachmentFiles/add(FileName='{}')",
            self.hostname, self.site_path, self.config.list_name, item_id, filename
        )
    }

    async fn load_existing_ids_inner(&self) -> Result<HashSet<String>> {
        let site_id = self.site_id().await?;
        let list_id = self.list_id().await?;
        let token = self.graph_token().await?;

        let mut existing = HashSet::new();
        let mut url = format!(
            "{GRAPH_BASE_URL}/sites/{site_id}/lists/{list_id}/items?$expand=fields&$select=fields"
        );

        loop {
            let page: ItemsPage = self
                .http
                .get_json(&url, &[], Some(&token))
                .await
                .context("reading existing notice identifiers")?;

            for item in page.value {
                if let Some(notice_id) = item.fields.get("NoticeId").and_then(JsonValue::as_str) {
                    existing.insert(notice_id.to_string());
                }
            }

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        info!(count = existing.len(), "loaded existing-key index");
        Ok(existing)
    }
}

fn item_id_to_string(id: &JsonValue) -> String {
    match id {
        JsonValue::String(value) => value.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Destination for SharePointClient {
    async fn load_existing_ids(&self) -> Result<HashSet<String>, SyncError> {
        self.load_existing_ids_inner()
            .await
            .map_err(|err| SyncError::index_load(format!("{err:#}")))
    }

    async fn create_record(&self, fields: &RecordFields) -> Result<ItemRef, SyncError> {
        let inner = async {
            let site_id = self.site_id().await?;
            let list_id = self.list_id().await?;
            let token = self.graph_token().await?;

            let url = format!("{GRAPH_BASE_URL}/sites/{site_id}/lists/{list_id}/items");
            let payload = serde_json::json!({ "fields": fields });
            let created: CreatedItem = self
                .http
                .post_json(&url, &payload, Some(&token))
                .await
                .context("creating destination list item")?;
            anyhow::Ok(item_id_to_string(&created.id))
        };

        match inner.await {
            Ok(item_id) => Ok(ItemRef { item_id }),
            Err(err) => Err(SyncError::create_failed(
                fields.notice_id.clone(),
                format!("{err:#}"),
            )),
        }
    }

    async fn add_attachment(
        &self,
        item: &ItemRef,
        filename: &str,
        content: &[u8],
    ) -> Result<(), SyncError> {
        let inner = async {
            let token = self.tokens.bearer_token(&self.rest_scope()).await?;
            let url = self.attachment_url(&item.item_id, filename);
            self.http
                .post_bytes(
                    &url,
                    content,
                    "application/octet-stream",
                    Some("application/json;odata=verbose"),
                    &token,
                )
                .await
                .with_context(|| format!("attaching {filename}"))?;
            anyhow::Ok(())
        };

        inner
            .await
            .map_err(|err| SyncError::attachment_failed(filename, format!("{err:#}")))
    }
}
