use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::{Cursor, Read};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::payload::CompiledRequest;
use crate::transport::{ByteStream, GenerationTransport, ReferenceEncoder};
use crate::types::Subscription;

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Async client for NovelAI's account and image APIs.
///
/// Authenticates every call with the bearer token it was created with.
/// Checking that the token is valid (see [`subscription()`](Self::subscription))
/// is the caller's job before starting a scheduler run.
///
/// # Example
/// ```no_run
/// use novelai_rs::{compile, GenerationParameters, NovelAiClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = NovelAiClient::new("pst-xxxx");
/// let params = GenerationParameters::new("1girl, sunset", "nai-diffusion-4-5-full");
/// let request = compile(&params, &client).await?;
/// let png = client.generate(&request).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct NovelAiClient {
    http: Client,
    config: ClientConfig,
    token: String,
}

impl NovelAiClient {
    /// Create a client for the public NovelAI endpoints.
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_config(token, ClientConfig::default())
    }

    pub fn with_config(token: impl Into<String>, mut config: ClientConfig) -> Self {
        config.api_endpoint = normalize(config.api_endpoint);
        config.image_endpoint = normalize(config.image_endpoint);
        Self {
            http: Client::new(),
            config,
            token: token.into().trim().to_string(),
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn api_endpoint(&self) -> &str {
        &self.config.api_endpoint
    }

    pub fn image_endpoint(&self) -> &str {
        &self.config.image_endpoint
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    // ── Account ─────────────────────────────────────────────────────

    /// Fetch the subscription tier and Anlas balance. A rejected token maps
    /// to [`TransportError::Unauthorized`].
    pub async fn subscription(&self) -> Result<Subscription, TransportError> {
        let url = format!("{}/user/subscription", self.config.api_endpoint);
        let resp = self
            .http
            .get(&url)
            .timeout(self.config.request_timeout)
            .header("Authorization", self.bearer())
            .header("User-Agent", &self.config.user_agent)
            .send()
            .await
            .map_err(|e| TransportError::Network {
                context: format!("Cannot connect to NovelAI at {}", self.config.api_endpoint),
                source: e,
            })?;
        let resp = check_status(resp).await?;

        let data: SubscriptionResponse = resp.json().await.map_err(|e| TransportError::Network {
            context: "Failed to parse NovelAI subscription response".into(),
            source: e,
        })?;
        Ok(data.into_subscription())
    }

    // ── Vibe encoding ───────────────────────────────────────────────

    /// Encode a vibe reference image. Returns the raw encoded vibe.
    pub async fn encode_vibe(
        &self,
        image: &[u8],
        information_extracted: f64,
        model: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let url = format!("{}/ai/encode-vibe", self.config.image_endpoint);
        let body = json!({
            "image": STANDARD.encode(image),
            "information_extracted": information_extracted,
            "model": model,
        });
        let resp = self.post(&url, &body, self.config.request_timeout).await?;
        let bytes = resp.bytes().await.map_err(|e| TransportError::Network {
            context: "Failed to read encoded vibe".into(),
            source: e,
        })?;
        debug!(len = bytes.len(), "encoded vibe reference");
        Ok(bytes.to_vec())
    }

    // ── Generation ──────────────────────────────────────────────────

    /// Generate without streaming. The service answers with a ZIP archive
    /// holding one image; its bytes are returned.
    pub async fn generate(&self, request: &CompiledRequest) -> Result<Vec<u8>, TransportError> {
        let url = format!("{}/ai/generate-image", self.config.image_endpoint);
        let body = request
            .to_body(false)
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let resp = self.post(&url, &body, self.config.stream_timeout).await?;
        let bytes = resp.bytes().await.map_err(|e| TransportError::Network {
            context: "Failed to read generated image archive".into(),
            source: e,
        })?;
        extract_image_from_zip(&bytes)
    }

    /// Start a streaming generation. Chunks are the raw msgpack frame stream.
    pub async fn generate_stream(
        &self,
        request: &CompiledRequest,
    ) -> Result<ByteStream, TransportError> {
        let url = format!("{}/ai/generate-image-stream", self.config.image_endpoint);
        let body = request
            .to_body(true)
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let resp = self.post(&url, &body, self.config.stream_timeout).await?;

        Ok(resp
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| TransportError::Network {
                    context: "Generation stream interrupted".into(),
                    source: e,
                })
            })
            .boxed())
    }

    // ── Upscale ─────────────────────────────────────────────────────

    /// Upscale an image by `scale` (2 or 4). Returns the upscaled image bytes.
    pub async fn upscale(
        &self,
        image: &[u8],
        width: u32,
        height: u32,
        scale: u32,
    ) -> Result<Vec<u8>, TransportError> {
        let url = format!("{}/ai/upscale", self.config.api_endpoint);
        let body = json!({
            "image": STANDARD.encode(image),
            "width": width,
            "height": height,
            "scale": scale,
        });
        let resp = self.post(&url, &body, self.config.stream_timeout).await?;
        let bytes = resp.bytes().await.map_err(|e| TransportError::Network {
            context: "Failed to read upscaled image archive".into(),
            source: e,
        })?;
        extract_image_from_zip(&bytes)
    }

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: std::time::Duration,
    ) -> Result<Response, TransportError> {
        let resp = self
            .http
            .post(url)
            .timeout(timeout)
            .header("Authorization", self.bearer())
            .header("User-Agent", &self.config.user_agent)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Network {
                context: format!("Cannot connect to NovelAI at {}", url),
                source: e,
            })?;
        check_status(resp).await
    }
}

impl ReferenceEncoder for NovelAiClient {
    async fn encode_reference(
        &self,
        image: &[u8],
        information_extracted: f64,
        model: &str,
    ) -> Result<Vec<u8>, TransportError> {
        self.encode_vibe(image, information_extracted, model).await
    }
}

impl GenerationTransport for NovelAiClient {
    async fn open_stream(&self, request: &CompiledRequest) -> Result<ByteStream, TransportError> {
        self.generate_stream(request).await
    }
}

async fn check_status(resp: Response) -> Result<Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 401 {
        return Err(TransportError::Unauthorized);
    }
    let body = resp.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), "NovelAI request failed");
    Err(TransportError::Http {
        status: status.as_u16(),
        body,
    })
}

/// Pull the first file out of a ZIP archive.
pub fn extract_image_from_zip(bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| TransportError::Archive(e.to_string()))?;
    if archive.is_empty() {
        return Err(TransportError::Archive("archive is empty".into()));
    }

    let mut file = archive
        .by_index(0)
        .map_err(|e| TransportError::Archive(e.to_string()))?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .map_err(|e| TransportError::Archive(e.to_string()))?;
    Ok(contents)
}

#[derive(Debug, Deserialize, Serialize)]
struct SubscriptionResponse {
    tier: Option<i32>,
    #[serde(rename = "trainingStepsLeft")]
    training_steps_left: Option<TrainingSteps>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TrainingSteps {
    #[serde(rename = "fixedTrainingStepsLeft")]
    fixed_training_steps_left: Option<i64>,
    #[serde(rename = "purchasedTrainingSteps")]
    purchased_training_steps: Option<i64>,
}

impl SubscriptionResponse {
    fn into_subscription(self) -> Subscription {
        let tier = match self.tier {
            Some(3) => "opus",
            Some(2) => "scroll",
            Some(1) => "tablet",
            _ => "paper",
        };
        let steps = self.training_steps_left.as_ref();
        Subscription {
            tier: tier.to_string(),
            fixed_anlas: steps.and_then(|t| t.fixed_training_steps_left),
            purchased_anlas: steps.and_then(|t| t.purchased_training_steps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in files {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize("https://image.novelai.net/".into()), "https://image.novelai.net");
        assert_eq!(normalize("http://localhost:9000///".into()), "http://localhost:9000");
    }

    #[test]
    fn test_client_config() {
        let config = ClientConfig::builder()
            .with_image_endpoint("http://localhost:9000/")
            .build();
        let client = NovelAiClient::with_config("  pst-token \n", config);
        assert_eq!(client.image_endpoint(), "http://localhost:9000");
        assert_eq!(client.api_endpoint(), "https://api.novelai.net");
        assert_eq!(client.bearer(), "Bearer pst-token");
    }

    #[test]
    fn test_extract_first_file() {
        let archive = zip_with(&[("image_0.png", b"first"), ("image_1.png", b"second")]);
        assert_eq!(extract_image_from_zip(&archive).unwrap(), b"first");
    }

    #[test]
    fn test_extract_empty_archive() {
        let archive = zip_with(&[]);
        let err = extract_image_from_zip(&archive).unwrap_err();
        assert!(matches!(err, TransportError::Archive(msg) if msg.contains("empty")));
    }

    #[test]
    fn test_extract_not_a_zip() {
        assert!(matches!(
            extract_image_from_zip(b"\x89PNG not a zip"),
            Err(TransportError::Archive(_))
        ));
    }

    #[test]
    fn test_parse_subscription() {
        let data: SubscriptionResponse = serde_json::from_str(
            r#"{
            "tier": 3,
            "active": true,
            "trainingStepsLeft": {
                "fixedTrainingStepsLeft": 10000,
                "purchasedTrainingSteps": 250
            }
        }"#,
        )
        .unwrap();
        let sub = data.into_subscription();
        assert_eq!(sub.tier, "opus");
        assert_eq!(sub.fixed_anlas, Some(10000));
        assert_eq!(sub.purchased_anlas, Some(250));
    }

    #[test]
    fn test_parse_subscription_free_tier() {
        let data: SubscriptionResponse = serde_json::from_str(r#"{"tier": 0}"#).unwrap();
        let sub = data.into_subscription();
        assert_eq!(sub.tier, "paper");
        assert!(sub.fixed_anlas.is_none());
    }
}
