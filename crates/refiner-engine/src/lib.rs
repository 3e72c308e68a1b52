pub mod archive;
pub mod driver;
pub mod judge;
pub mod prompts;
pub mod providers;
pub mod retry;
pub mod round;

#[cfg(test)]
mod testing;

use std::env;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub use archive::RunArchive;
pub use driver::{RefineConfig, RunDriver, RunOutcome};
pub use judge::{build_judge, DryrunJudge, Judge, JudgeOptions, OpenAiJudge, VerboseJudge};
pub use prompts::TranscriptBuilder;
pub use providers::{
    default_provider_registry, ImageProvider, ImageProviderRegistry, RenderRequest,
    RenderedImage,
};
pub use retry::{with_retry, AttemptError, CancelToken, OracleError, RetryPolicy};
pub use round::{Candidate, PromptBatch, RoundController, RoundReport, RoundSettings};

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| non_empty_env(key))
}

pub(crate) fn openai_api_key() -> Option<String> {
    first_non_empty_env(&["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"])
}

pub(crate) fn openai_api_base() -> String {
    let raw = first_non_empty_env(&["OPENAI_API_BASE", "OPENAI_BASE_URL"])
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base.trim_end_matches('/').to_string()
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn stable_hash(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
