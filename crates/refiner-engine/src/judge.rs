use std::fs;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use refiner_contracts::events::EventWriter;
use refiner_contracts::models::{Capability, ModelSpec};
use refiner_contracts::tagged::{END_TAG, START_TAG};
use refiner_contracts::{ContentPart, JudgeRequest, Transcript};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use crate::retry::{with_retry, AttemptError, OracleError, RetryPolicy};
use crate::{map_object, openai_api_base, openai_api_key, stable_hash, truncate_text};

/// The language-and-vision oracle that writes prompts, ranks images and critiques them.
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;
    fn ask(&self, transcript: &Transcript, temperature: f64) -> Result<String, OracleError>;
}

impl<J: Judge + ?Sized> Judge for Box<J> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn ask(&self, transcript: &Transcript, temperature: f64) -> Result<String, OracleError> {
        (**self).ask(transcript, temperature)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JudgeOptions {
    pub api_key: Option<String>,
    pub policy: RetryPolicy,
    pub events: Option<EventWriter>,
    pub request_timeout: Option<Duration>,
}

pub fn build_judge(model: &ModelSpec, options: JudgeOptions) -> anyhow::Result<Box<dyn Judge>> {
    if model.capability != Capability::Judge {
        return Err(OracleError::NotConfigured(format!(
            "'{}' is a {} model and cannot judge",
            model.name, model.capability
        ))
        .into());
    }
    match model.provider.as_str() {
        "dryrun" => Ok(Box::new(DryrunJudge::new(model.name.clone()))),
        "openai" => {
            let Some(api_key) = options.api_key.clone().or_else(openai_api_key) else {
                return Err(OracleError::NotConfigured(
                    "OPENAI_API_KEY or OPENAI_API_KEY_BACKUP not set".to_string(),
                )
                .into());
            };
            Ok(Box::new(OpenAiJudge::new(model, api_key, options)?))
        }
        other => Err(OracleError::NotConfigured(format!(
            "no judge client for provider '{other}'"
        ))
        .into()),
    }
}

/// Chat-completions judge. Images travel as base64 data URLs.
pub struct OpenAiJudge {
    api_base: String,
    api_key: String,
    model: String,
    max_tokens: u64,
    top_p: f64,
    image_max_dim: u32,
    policy: RetryPolicy,
    events: Option<EventWriter>,
    http: HttpClient,
}

impl OpenAiJudge {
    pub fn new(model: &ModelSpec, api_key: String, options: JudgeOptions) -> anyhow::Result<Self> {
        let timeout = options
            .request_timeout
            .unwrap_or_else(|| Duration::from_secs(120));
        let http = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self {
            api_base: openai_api_base(),
            api_key,
            model: model.name.clone(),
            max_tokens: model.max_output_tokens.unwrap_or(512),
            top_p: 0.5,
            image_max_dim: 512,
            policy: options.policy,
            events: options.events,
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn encode_messages(&self, transcript: &Transcript) -> Result<Vec<Value>, OracleError> {
        let mut messages = Vec::with_capacity(transcript.messages.len());
        for message in &transcript.messages {
            let mut content = Vec::with_capacity(message.content.len());
            for part in &message.content {
                match part {
                    ContentPart::Text { text } => {
                        content.push(json!({"type": "text", "text": text}));
                    }
                    ContentPart::Image { image, detail } => {
                        let url = image_data_url(image.path(), self.image_max_dim)
                            .map_err(|err| OracleError::Encoding(format!("{err:#}")))?;
                        content.push(json!({
                            "type": "image_url",
                            "image_url": {"url": url, "detail": detail.as_str()},
                        }));
                    }
                }
            }
            messages.push(json!({"role": message.role.as_str(), "content": content}));
        }
        Ok(messages)
    }

    fn attempt(&self, messages: &[Value], temperature: f64) -> Result<String, AttemptError> {
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": temperature,
            "top_p": self.top_p,
            "messages": messages,
        });
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .map_err(|err| AttemptError::Transport(err.to_string()))?;
        let code = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| AttemptError::Transport(err.to_string()))?;
        chat_reply(code, &body)
    }
}

impl Judge for OpenAiJudge {
    fn name(&self) -> &str {
        &self.model
    }

    fn ask(&self, transcript: &Transcript, temperature: f64) -> Result<String, OracleError> {
        let messages = self.encode_messages(transcript)?;
        with_retry(
            &self.policy,
            temperature,
            |temperature| self.attempt(&messages, temperature),
            |notice| {
                if let Some(events) = &self.events {
                    let _ = events.emit(
                        "judge_retry",
                        map_object(json!({
                            "request": transcript.request.label(),
                            "attempt": notice.attempt,
                            "max_attempts": notice.max_attempts,
                            "error": notice.error.to_string(),
                            "next_temperature": notice.next_temperature,
                            "delay_s": notice.delay.as_secs_f64(),
                        })),
                    );
                }
            },
        )
    }
}

/// Maps one chat-completions HTTP reply onto the retry classification.
fn chat_reply(code: u16, body: &str) -> Result<String, AttemptError> {
    if !(200..300).contains(&code) {
        return Err(AttemptError::Status {
            code,
            body: truncate_text(body, 512),
        });
    }
    let parsed: Value = serde_json::from_str(body)
        .map_err(|err| AttemptError::MissingContent(format!("invalid JSON payload: {err}")))?;
    extract_chat_text(&parsed)
        .ok_or_else(|| AttemptError::MissingContent("response has no choices".to_string()))
}

fn extract_chat_text(response: &Value) -> Option<String> {
    let content = response
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?;
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

/// Offline judge: answers every request well-formed, derived from a hash of the transcript.
pub struct DryrunJudge {
    name: String,
}

const DRYRUN_MODIFIERS: [&str; 6] = [
    "soft morning light, wide angle",
    "golden hour, shallow depth of field",
    "overcast sky, muted palette",
    "high contrast, cinematic framing",
    "studio lighting, crisp detail",
    "watercolor texture, pastel tones",
];

const DRYRUN_ASPECTS: [&str; 5] = [
    "object count",
    "color of the main subject",
    "spatial relationship between the objects",
    "relative size of the objects",
    "background appearance",
];

impl DryrunJudge {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn idea_label(transcript: &Transcript) -> String {
        transcript
            .user()
            .and_then(|message| message.texts().next())
            .map(|text| {
                text.trim()
                    .trim_start_matches("IDEA:")
                    .trim()
                    .trim_end_matches('.')
                    .to_string()
            })
            .unwrap_or_default()
    }
}

impl Judge for DryrunJudge {
    fn name(&self) -> &str {
        &self.name
    }

    fn ask(&self, transcript: &Transcript, _temperature: f64) -> Result<String, OracleError> {
        let digest = stable_hash(&serde_json::to_value(transcript).unwrap_or(Value::Null));
        let seed = u64::from_str_radix(&digest[..12], 16).unwrap_or_default();
        let text = match transcript.request {
            JudgeRequest::Prompts { count } => {
                let label = Self::idea_label(transcript);
                (0..count)
                    .map(|idx| {
                        let modifier =
                            DRYRUN_MODIFIERS[(seed as usize + idx) % DRYRUN_MODIFIERS.len()];
                        format!(
                            "{START_TAG}{label}, {modifier}, variation {}-{idx}{END_TAG}",
                            &digest[..6]
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            JudgeRequest::SelectBest { candidates } if candidates > 0 => {
                let best = (seed % candidates as u64) as usize;
                let scores = (0..candidates)
                    .map(|idx| {
                        let score = if idx == best { 9 } else { 5 + (idx % 3) };
                        format!("{idx}: {score}/10")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("Scores: {scores}. {START_TAG}{best}{END_TAG}")
            }
            JudgeRequest::SelectBest { .. } => "No candidates were provided.".to_string(),
            JudgeRequest::Critique { round } => {
                let aspect = DRYRUN_ASPECTS[(seed as usize + round) % DRYRUN_ASPECTS.len()];
                format!(
                    "{START_TAG}the {aspect} does not match the IDEA yet; describe the {aspect} explicitly in the prompt{END_TAG}"
                )
            }
        };
        Ok(text)
    }
}

/// Prints every judge response to stderr before handing it on.
pub struct VerboseJudge<J> {
    inner: J,
}

impl<J: Judge> VerboseJudge<J> {
    pub fn new(inner: J) -> Self {
        Self { inner }
    }
}

impl<J: Judge> Judge for VerboseJudge<J> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn ask(&self, transcript: &Transcript, temperature: f64) -> Result<String, OracleError> {
        let response = self.inner.ask(transcript, temperature)?;
        let label = transcript
            .user()
            .and_then(|message| message.content.first())
            .and_then(ContentPart::as_text)
            .unwrap_or_default();
        eprintln!(
            "[{}] {} (t={temperature:.1}) {label}\n{response}\n",
            self.inner.name(),
            transcript.request.label(),
        );
        Ok(response)
    }
}

pub(crate) fn image_data_url(path: &Path, max_dim: u32) -> anyhow::Result<String> {
    let (bytes, mime) = prepare_vision_image(path, max_dim)?;
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

fn prepare_vision_image(path: &Path, max_dim: u32) -> anyhow::Result<(Vec<u8>, String)> {
    let dim = max_dim.max(128);
    if let Ok(image) = image::open(path) {
        let rgba = image.to_rgba8();
        let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = u16::from(pixel[3]);
            let blend = |channel: u8| -> u8 {
                (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
            };
            flattened.put_pixel(
                x,
                y,
                Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
            );
        }
        let mut flattened = DynamicImage::ImageRgba8(flattened);
        if flattened.width() > dim || flattened.height() > dim {
            flattened = flattened.resize(dim, dim, FilterType::Triangle);
        }
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
        if encoder
            .encode_image(&DynamicImage::ImageRgb8(flattened.to_rgb8()))
            .is_ok()
        {
            return Ok((bytes, "image/jpeg".to_string()));
        }
    }

    let bytes = fs::read(path)
        .map_err(|err| anyhow::anyhow!("failed reading {}: {err}", path.display()))?;
    Ok((bytes, guess_image_mime(path).to_string()))
}

fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use refiner_contracts::models::ModelCatalog;
    use refiner_contracts::tagged::{extract, extract_index, extract_one};
    use refiner_contracts::{ImageDetail, ImageRef, JudgeRequest, Message, Role, Transcript};
    use serde_json::json;

    use super::{
        build_judge, chat_reply, extract_chat_text, image_data_url, DryrunJudge, Judge, JudgeOptions,
        OpenAiJudge,
    };
    use crate::retry::AttemptError;

    fn transcript(request: JudgeRequest) -> Transcript {
        let mut system = Message::new(Role::System);
        system.push_text("rules");
        let mut user = Message::new(Role::User);
        user.push_text("IDEA: a red bicycle leaning against a blue wall.");
        user.push_text("End of IDEA.\n");
        Transcript::new(request, system, user)
    }

    #[test]
    fn dryrun_judge_answers_each_request_in_tags() -> anyhow::Result<()> {
        let judge = DryrunJudge::new("dryrun-judge-1");

        let prompts = judge.ask(&transcript(JudgeRequest::Prompts { count: 3 }), 0.0)?;
        let values = extract(&prompts).values().to_vec();
        assert_eq!(values.len(), 3);
        assert!(values[0].starts_with("a red bicycle leaning against a blue wall,"));
        assert_ne!(values[0], values[1]);

        let select = judge.ask(&transcript(JudgeRequest::SelectBest { candidates: 4 }), 0.0)?;
        assert!(extract_index(&select, 4).is_ok());

        let critique = judge.ask(&transcript(JudgeRequest::Critique { round: 0 }), 0.0)?;
        assert!(extract_one(&critique).is_ok());
        Ok(())
    }

    #[test]
    fn dryrun_judge_is_deterministic() -> anyhow::Result<()> {
        let judge = DryrunJudge::new("dryrun-judge-1");
        let request = transcript(JudgeRequest::SelectBest { candidates: 7 });
        assert_eq!(judge.ask(&request, 0.0)?, judge.ask(&request, 0.9)?);
        Ok(())
    }

    #[test]
    fn build_judge_picks_client_by_provider() -> anyhow::Result<()> {
        let catalog = ModelCatalog::builtin();
        let dryrun = catalog
            .get("dryrun-judge-1")
            .ok_or_else(|| anyhow::anyhow!("missing dryrun judge"))?;
        let judge = build_judge(dryrun, JudgeOptions::default())?;
        assert_eq!(judge.name(), "dryrun-judge-1");

        let openai = catalog
            .get("gpt-4o")
            .ok_or_else(|| anyhow::anyhow!("missing gpt-4o"))?;
        let options = JudgeOptions {
            api_key: Some("sk-test".to_string()),
            ..JudgeOptions::default()
        };
        assert_eq!(build_judge(openai, options)?.name(), "gpt-4o");

        let renderer = catalog
            .get("dryrun-image-1")
            .ok_or_else(|| anyhow::anyhow!("missing dryrun image model"))?;
        assert!(build_judge(renderer, JudgeOptions::default()).is_err());
        Ok(())
    }

    #[test]
    fn chat_reply_classifies_http_outcomes() {
        assert_eq!(
            chat_reply(200, r#"{"choices": [{"message": {"content": "<START>0<END>"}}]}"#),
            Ok("<START>0<END>".to_string())
        );
        assert!(matches!(
            chat_reply(429, "rate limited"),
            Err(AttemptError::Status { code: 429, ref body }) if body == "rate limited"
        ));
        assert!(matches!(
            chat_reply(503, ""),
            Err(AttemptError::Status { code: 503, .. })
        ));
        assert!(matches!(
            chat_reply(200, r#"{"id": "chatcmpl-1", "object": "chat.completion"}"#),
            Err(AttemptError::MissingContent(_))
        ));
        assert!(matches!(
            chat_reply(200, "<html>gateway</html>"),
            Err(AttemptError::MissingContent(_))
        ));
    }

    #[test]
    fn unreachable_endpoint_is_a_transport_failure() -> anyhow::Result<()> {
        let catalog = ModelCatalog::builtin();
        let model = catalog
            .get("gpt-4o")
            .ok_or_else(|| anyhow::anyhow!("missing gpt-4o"))?;
        let mut judge = OpenAiJudge::new(
            model,
            "sk-test".to_string(),
            JudgeOptions {
                request_timeout: Some(std::time::Duration::from_secs(5)),
                ..JudgeOptions::default()
            },
        )?;
        judge.api_base = "http://127.0.0.1:9/v1".to_string();
        assert!(matches!(
            judge.attempt(&[], 0.0),
            Err(AttemptError::Transport(_))
        ));
        Ok(())
    }

    #[test]
    fn chat_text_reads_string_and_part_content() {
        let plain = json!({"choices": [{"message": {"content": "<START>1<END>"}}]});
        assert_eq!(extract_chat_text(&plain).as_deref(), Some("<START>1<END>"));
        let parts = json!({"choices": [{"message": {"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]}}]});
        assert_eq!(extract_chat_text(&parts).as_deref(), Some("a\nb"));
        assert!(extract_chat_text(&json!({"error": "x"})).is_none());
    }

    #[test]
    fn image_data_url_downscales_to_jpeg() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("big.png");
        RgbImage::from_pixel(1024, 512, Rgb([10, 20, 30])).save(&path)?;
        let url = image_data_url(&path, 256)?;
        assert!(url.starts_with("data:image/jpeg;base64,"));

        let reference = ImageRef::new(path);
        assert_eq!(ImageDetail::default().as_str(), "low");
        assert!(reference.path().exists());
        Ok(())
    }
}
