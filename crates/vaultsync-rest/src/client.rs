use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use vaultsync_core::VaultError;

/// Connection settings for a PostgREST + object storage deployment.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Project URL, e.g. `https://example.supabase.co`
    pub base_url: String,
    /// Anonymous API key sent as `apikey`
    pub api_key: String,
    /// User session token; the API key is used when absent
    pub access_token: Option<String>,
    /// Storage bucket holding content blobs
    pub bucket: String,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
            bucket: "vault-files".to_string(),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }
}

/// PostgREST error payload.
#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Thin HTTP layer: auth headers, PostgREST conventions and status mapping.
///
/// Database functions raise with SQLSTATE `PT403`, `PT404` or `PT409`, which
/// PostgREST turns into the matching HTTP status. `409` carries the current
/// lock holder in `details`.
pub struct RestClient {
    http_client: HttpClient,
    config: RestConfig,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Self {
        Self {
            http_client: HttpClient::new(),
            config,
        }
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let token = self
            .config
            .access_token
            .as_deref()
            .unwrap_or(&self.config.api_key);
        self.http_client
            .request(method, url)
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", token))
    }

    /// URL of a table with an already-encoded query string.
    pub fn table_url(&self, table: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}/rest/v1/{}", self.config.base_url, table)
        } else {
            format!("{}/rest/v1/{}?{}", self.config.base_url, table, query)
        }
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.config.base_url, function)
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.config.base_url,
            self.config.bucket,
            urlencoding::encode(key)
        )
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> Result<Response, VaultError> {
        let response = request
            .send()
            .await
            .map_err(|e| VaultError::Network(format!("{} request failed: {}", context, e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let api: ApiError = serde_json::from_str(&text).unwrap_or_default();
        let message = api.message.clone().unwrap_or_else(|| text.clone());
        debug!("{} failed with status {} ({:?}): {}", context, status, api.code, message);
        Err(map_status(status, context, message, api.details))
    }

    async fn json<T: DeserializeOwned>(response: Response, context: &str) -> Result<T, VaultError> {
        response
            .json::<T>()
            .await
            .map_err(|e| VaultError::Serialization(format!("Failed to parse {} response: {}", context, e)))
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn select<T: DeserializeOwned>(&self, table: &str, query: &str) -> Result<Vec<T>, VaultError> {
        let url = self.table_url(table, query);
        let response = self.send(self.request(Method::GET, &url), table).await?;
        Self::json(response, table).await
    }

    /// Insert one row and return the stored representation.
    #[instrument(skip(self, row), level = "debug")]
    pub async fn insert<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        row: &B,
    ) -> Result<Vec<T>, VaultError> {
        let url = self.table_url(table, "");
        let request = self
            .request(Method::POST, &url)
            .header("Prefer", "return=representation")
            .json(row);
        let response = self.send(request, table).await?;
        Self::json(response, table).await
    }

    /// Insert without reading anything back.
    pub async fn insert_minimal<B: Serialize + ?Sized>(&self, table: &str, row: &B) -> Result<(), VaultError> {
        let url = self.table_url(table, "");
        let request = self
            .request(Method::POST, &url)
            .header("Prefer", "return=minimal")
            .json(row);
        self.send(request, table).await?;
        Ok(())
    }

    /// Conditional update: only rows matching `query` change. Returns the
    /// updated rows, empty when the filter matched nothing.
    #[instrument(skip(self, patch), level = "debug")]
    pub async fn update<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
        patch: &B,
    ) -> Result<Vec<T>, VaultError> {
        let url = self.table_url(table, query);
        let request = self
            .request(Method::PATCH, &url)
            .header("Prefer", "return=representation")
            .json(patch);
        let response = self.send(request, table).await?;
        Self::json(response, table).await
    }

    /// Call a database function.
    #[instrument(skip(self, args), level = "debug")]
    pub async fn rpc<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        function: &str,
        args: &B,
    ) -> Result<T, VaultError> {
        let url = self.rpc_url(function);
        let response = self
            .send(self.request(Method::POST, &url).json(args), function)
            .await?;
        Self::json(response, function).await
    }

    /// Call a database function returning `void`; the body, usually empty
    /// with a 204, is ignored.
    #[instrument(skip(self, args), level = "debug")]
    pub async fn rpc_void<B: Serialize + ?Sized>(&self, function: &str, args: &B) -> Result<(), VaultError> {
        let url = self.rpc_url(function);
        self.send(self.request(Method::POST, &url).json(args), function)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    pub async fn upload_object(&self, key: &str, data: &[u8]) -> Result<(), VaultError> {
        let url = self.object_url(key);
        // Keys are content hashes, so overwriting is harmless
        let request = self
            .request(Method::POST, &url)
            .header("Content-Type", "application/octet-stream")
            .header("x-upsert", "true")
            .body(data.to_vec());
        self.send(request, "storage upload").await?;
        debug!("Uploaded object {} ({} bytes)", key, data.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn download_object(&self, key: &str) -> Result<Vec<u8>, VaultError> {
        let url = self.object_url(key);
        let response = match self.send(self.request(Method::GET, &url), "storage download").await {
            // Storage reports a missing object as 400 on some deployments
            Err(VaultError::InvalidArgument(_)) => {
                return Err(VaultError::NotFound(format!("Object {}", key)));
            }
            other => other?,
        };
        let bytes = response
            .bytes()
            .await
            .map_err(|e| VaultError::Network(format!("Failed to read object {}: {}", key, e)))?;
        Ok(bytes.to_vec())
    }
}

fn map_status(status: StatusCode, context: &str, message: String, details: Option<String>) -> VaultError {
    match status {
        StatusCode::NOT_FOUND => VaultError::NotFound(format!("{}: {}", context, message)),
        StatusCode::FORBIDDEN => VaultError::NotOwner(message),
        StatusCode::CONFLICT => VaultError::AlreadyLocked {
            holder: details.unwrap_or(message),
        },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            VaultError::InvalidArgument(format!("{}: {}", context, message))
        }
        StatusCode::UNAUTHORIZED => {
            VaultError::Network(format!("{} unauthorized: {}", context, message))
        }
        _ => VaultError::Network(format!(
            "{} failed with status {}: {}",
            context, status, message
        )),
    }
}

/// Encode a PostgREST `eq.` filter value.
pub fn eq(value: &str) -> String {
    format!("eq.{}", urlencoding::encode(value))
}
