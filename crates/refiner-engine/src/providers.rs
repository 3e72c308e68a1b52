use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use refiner_contracts::models::{Capability, ModelSpec};
use refiner_contracts::ImageRef;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::{map_object, openai_api_base, openai_api_key, truncate_text};

#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Where the provider writes the rendered image.
    pub out_path: PathBuf,
    pub prompt: String,
    pub size: String,
    pub strength: f64,
    pub seed: Option<u64>,
    pub model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub image: ImageRef,
    pub width: u32,
    pub height: u32,
    pub warnings: Vec<String>,
}

/// The image-synthesis engine. Failures are fatal to the run that asked for the render.
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn render(&self, request: &RenderRequest) -> Result<RenderedImage>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// The provider that renders with `model`.
    pub fn for_model(&self, model: &ModelSpec) -> Result<&dyn ImageProvider> {
        if model.capability != Capability::Image {
            bail!(
                "'{}' is a {} model and cannot render images",
                model.name,
                model.capability
            );
        }
        self.get(&model.provider).ok_or_else(|| {
            anyhow!(
                "no image provider '{}' for model '{}' (known: {})",
                model.provider,
                model.name,
                self.names().join(", ")
            )
        })
    }
}

pub fn default_provider_registry() -> ImageProviderRegistry {
    let mut providers = ImageProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(OpenAiProvider::new());
    providers
}

/// Writes a solid-colour PNG whose colour is derived from the prompt.
pub struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn render(&self, request: &RenderRequest) -> Result<RenderedImage> {
        let (width, height) = parse_dims(&request.size);
        write_dryrun_image(
            &request.out_path,
            width,
            height,
            &request.prompt,
            request.seed,
            request.strength,
        )?;
        Ok(RenderedImage {
            image: ImageRef::new(request.out_path.clone()),
            width,
            height,
            warnings: Vec::new(),
        })
    }
}

pub struct OpenAiProvider {
    api_base: String,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            api_base: openai_api_base(),
            http: HttpClient::new(),
        }
    }

    fn is_dall_e(model: &str) -> bool {
        model.trim().to_ascii_lowercase().starts_with("dall-e")
    }

    fn extract_image_bytes(&self, response_payload: &Value) -> Result<Vec<u8>> {
        let Some(row) = response_payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
        else {
            bail!("OpenAI response returned no images");
        };
        if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
            return BASE64
                .decode(b64.as_bytes())
                .context("OpenAI image base64 decode failed");
        }
        if let Some(url) = row.get("url").and_then(Value::as_str) {
            return self.download_image(url);
        }
        bail!("OpenAI image row has neither b64_json nor url")
    }

    fn download_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading provider image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "provider image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        Ok(response
            .bytes()
            .context("failed reading provider image bytes")?
            .to_vec())
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn render(&self, request: &RenderRequest) -> Result<RenderedImage> {
        let Some(api_key) = request.api_key.clone().or_else(openai_api_key) else {
            bail!("OPENAI_API_KEY or OPENAI_API_KEY_BACKUP not set");
        };
        let endpoint = format!("{}/images/generations", self.api_base);
        let mut warnings = Vec::new();
        if (request.strength - 1.0).abs() > f64::EPSILON {
            warnings.push(format!(
                "OpenAI image generation ignores strength {:.2}.",
                request.strength
            ));
        }
        let mut payload = map_object(json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": 1,
            "size": request.size,
        }));
        if Self::is_dall_e(&request.model) {
            payload.insert(
                "response_format".to_string(),
                Value::String("b64_json".to_string()),
            );
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&Value::Object(payload))
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("OpenAI", response)?;
        let bytes = self.extract_image_bytes(&response_payload)?;
        if let Some(parent) = request.out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.out_path, &bytes)
            .with_context(|| format!("failed to write {}", request.out_path.display()))?;
        let (width, height) = image::image_dimensions(&request.out_path)
            .unwrap_or_else(|_| parse_dims(&request.size));

        Ok(RenderedImage {
            image: ImageRef::new(request.out_path.clone()),
            width,
            height,
            warnings,
        })
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub(crate) fn parse_dims(size: &str) -> (u32, u32) {
    let Some((w, h)) = size.trim().to_ascii_lowercase().split_once('x').map(|(w, h)| {
        (
            w.trim().parse::<u32>().unwrap_or(1024),
            h.trim().parse::<u32>().unwrap_or(1024),
        )
    }) else {
        return (1024, 1024);
    };
    (w.max(1), h.max(1))
}

fn write_dryrun_image(
    path: &Path,
    width: u32,
    height: u32,
    prompt: &str,
    seed: Option<u64>,
    strength: f64,
) -> Result<()> {
    let (r, g, b) = color_from_prompt(prompt, seed.unwrap_or_default());
    let scale = strength.clamp(0.0, 1.0);
    let tone = |channel: u8| -> u8 { (f64::from(channel) * scale + 128.0 * (1.0 - scale)) as u8 };
    let image = RgbImage::from_pixel(width, height, Rgb([tone(r), tone(g), tone(b)]));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    image
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
