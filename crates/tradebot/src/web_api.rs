// Steam Web API client for backpacks and the item schema.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use tradebot_app::client::{InventoryError, InventoryFetcher, SchemaError, SchemaFetcher};
use tradebot_core::inventory::{Inventory, InventoryFetch, InventoryItem, ItemSchema, SchemaItem};
use tradebot_core::protocol::SteamId;

const API_BASE_URL: &str = "https://api.steampowered.com";

/// Upper bound for one API call. Fetches run on the dispatch task.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// `result.status` for a readable backpack.
const STATUS_OK: i64 = 1;
/// `result.status` for a private backpack.
const STATUS_PRIVATE: i64 = 15;

pub struct WebApi {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl WebApi {
    pub fn new(api_key: String) -> Result<Self, reqwest::Error> {
        Self::with_base_url(api_key, API_BASE_URL.to_string(), REQUEST_TIMEOUT)
    }

    pub fn with_base_url(
        api_key: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<String, String> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("GET {}", url);
        self.http
            .get(&url)
            .query(&[("key", self.api_key.as_str())])
            .query(params)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(describe)?
            .text()
            .await
            .map_err(describe)
    }
}

fn describe(e: reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timed out: {e}")
    } else {
        e.to_string()
    }
}

#[async_trait]
impl InventoryFetcher for WebApi {
    async fn fetch(&self, owner: SteamId) -> Result<InventoryFetch, InventoryError> {
        let steam_id = owner.to_string();
        let body = self
            .get(
                "IEconItems_440/GetPlayerItems/v0001/",
                &[("SteamID", steam_id.as_str())],
            )
            .await
            .map_err(|message| InventoryError::Request { owner, message })?;
        parse_player_items(owner, &body)
    }
}

#[async_trait]
impl SchemaFetcher for WebApi {
    async fn fetch_schema(&self) -> Result<ItemSchema, SchemaError> {
        let body = self
            .get("IEconItems_440/GetSchema/v0001/", &[("language", "en")])
            .await
            .map_err(SchemaError::Request)?;
        parse_schema(&body)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct PlayerItemsResult {
    status: i64,
    #[serde(default)]
    items: Vec<InventoryItem>,
}

#[derive(Deserialize)]
struct SchemaResult {
    status: i64,
    #[serde(default)]
    items: Vec<RawSchemaItem>,
}

#[derive(Deserialize)]
struct RawSchemaItem {
    defindex: u32,
    name: String,
    #[serde(default)]
    item_name: Option<String>,
}

pub fn parse_player_items(owner: SteamId, body: &str) -> Result<InventoryFetch, InventoryError> {
    let envelope: Envelope<PlayerItemsResult> =
        serde_json::from_str(body).map_err(|e| InventoryError::Malformed {
            owner,
            message: e.to_string(),
        })?;
    match envelope.result.status {
        STATUS_OK => Ok(InventoryFetch::Available(Inventory::new(
            owner,
            envelope.result.items,
        ))),
        STATUS_PRIVATE => Ok(InventoryFetch::Restricted),
        status => Err(InventoryError::Status { owner, status }),
    }
}

pub fn parse_schema(body: &str) -> Result<ItemSchema, SchemaError> {
    let envelope: Envelope<SchemaResult> =
        serde_json::from_str(body).map_err(|e| SchemaError::Malformed(e.to_string()))?;
    if envelope.result.status != STATUS_OK {
        return Err(SchemaError::Request(format!(
            "schema status {}",
            envelope.result.status
        )));
    }
    Ok(ItemSchema::from_items(envelope.result.items.into_iter().map(
        |raw| SchemaItem {
            defindex: raw.defindex,
            name: raw.item_name.unwrap_or(raw.name),
        },
    )))
}
