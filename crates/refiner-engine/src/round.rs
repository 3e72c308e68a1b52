use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use refiner_contracts::events::EventWriter;
use refiner_contracts::tagged::{self, FallbackReason, TaggedOutput};
use refiner_contracts::{
    Idea, ImageRef, RoundRecord, RunHistory, SelectionResult, SelectionSource, Transcript,
};
use serde_json::json;

use crate::judge::Judge;
use crate::prompts::TranscriptBuilder;
use crate::providers::{ImageProvider, RenderRequest};
use crate::{map_object, truncate_text};

/// Literal prompt used to pad a short prompt list.
pub const PLACEHOLDER_PROMPT: &str = "blank image";
pub const BASE_TEMPERATURE: f64 = 0.0;
/// Temperature of the single format retry after a response without delimiters.
pub const FORMAT_RETRY_TEMPERATURE: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct RoundSettings {
    pub num_prompts: usize,
    pub images_per_prompt: usize,
    pub strength: f64,
    pub size: String,
    pub image_model: String,
    pub api_key: Option<String>,
    pub seed: Option<u64>,
    pub parallel_render: bool,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            num_prompts: 3,
            images_per_prompt: 1,
            strength: 1.0,
            size: "1024x1024".to_string(),
            image_model: "dryrun-image-1".to_string(),
            api_key: None,
            seed: None,
            parallel_render: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptBatch {
    pub prompts: Vec<String>,
    pub raw: String,
    pub padded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub index: usize,
    pub prompt: String,
    pub image: ImageRef,
}

#[derive(Debug, Clone)]
pub struct RoundReport {
    pub round: usize,
    pub prompts: PromptBatch,
    pub candidates: Vec<Candidate>,
    pub selection: SelectionResult,
    /// `None` on the terminal round.
    pub critique: Option<String>,
}

/// Runs one generate, render, select, critique cycle.
pub struct RoundController<'a> {
    judge: &'a dyn Judge,
    provider: &'a dyn ImageProvider,
    builder: TranscriptBuilder,
    settings: &'a RoundSettings,
    events: &'a EventWriter,
    candidate_dir: PathBuf,
}

impl<'a> RoundController<'a> {
    pub fn new(
        judge: &'a dyn Judge,
        provider: &'a dyn ImageProvider,
        builder: TranscriptBuilder,
        settings: &'a RoundSettings,
        events: &'a EventWriter,
        candidate_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            judge,
            provider,
            builder,
            settings,
            events,
            candidate_dir: candidate_dir.into(),
        }
    }

    /// Executes round `history.len()` and appends its record.
    pub fn run<R: Rng + ?Sized>(
        &self,
        idea: &Idea,
        history: &mut RunHistory,
        terminal: bool,
        rng: &mut R,
    ) -> Result<RoundReport> {
        if self.settings.images_per_prompt != 1 {
            bail!(
                "images_per_prompt must be 1 (got {})",
                self.settings.images_per_prompt
            );
        }
        let round = history.len();
        self.events.emit(
            "round_started",
            map_object(json!({"round": round, "terminal": terminal})),
        )?;

        let prompts = self.generate_prompts(idea, history)?;
        let candidates = self.render_candidates(round, &prompts.prompts)?;
        let images: Vec<ImageRef> = candidates.iter().map(|c| c.image.clone()).collect();
        let selection = select_best(self.judge, &self.builder, idea, &images, rng, self.events)?;
        self.events.emit(
            "selection_made",
            map_object(json!({
                "round": round,
                "index": selection.index,
                "source": selection.source.label(),
                "fallback_reason": selection.source.fallback_reason(),
                "rationale": truncate_text(&selection.rationale, 2000),
            })),
        )?;

        let chosen = candidates
            .get(selection.index)
            .ok_or_else(|| anyhow!("selection index {} out of range", selection.index))?;
        let critique = if terminal {
            None
        } else {
            Some(self.critique(idea, history, chosen)?)
        };

        history.append(RoundRecord {
            round,
            prompt: chosen.prompt.clone(),
            image: chosen.image.clone(),
            selection_rationale: selection.rationale.clone(),
            critique: critique.clone().unwrap_or_default(),
            selected_index: selection.index,
        })?;
        self.events.emit(
            "round_finished",
            map_object(json!({
                "round": round,
                "selected_index": selection.index,
                "image": chosen.image,
            })),
        )?;

        Ok(RoundReport {
            round,
            prompts,
            candidates,
            selection,
            critique,
        })
    }

    /// Exactly `num_prompts` prompts for the next round.
    pub fn generate_prompts(&self, idea: &Idea, history: &RunHistory) -> Result<PromptBatch> {
        let count = self.settings.num_prompts;
        let transcript = if history.is_empty() {
            self.builder.initial_prompts(idea, count)
        } else {
            self.builder.revised_prompts(idea, history, count)
        };
        let raw = ask_tagged(self.judge, &transcript, self.events)?;
        let (prompts, padded) = fit_prompts(tagged::extract(&raw), count);
        self.events.emit(
            "prompts_generated",
            map_object(json!({
                "round": history.len(),
                "prompts": prompts,
                "padded": padded,
            })),
        )?;
        Ok(PromptBatch {
            prompts,
            raw,
            padded,
        })
    }

    pub fn render_candidates(&self, round: usize, prompts: &[String]) -> Result<Vec<Candidate>> {
        let requests: Vec<RenderRequest> = prompts
            .iter()
            .enumerate()
            .map(|(idx, prompt)| self.render_request(round, idx, prompt))
            .collect();

        let rendered = if self.settings.parallel_render && requests.len() > 1 {
            thread::scope(|scope| {
                let handles: Vec<_> = requests
                    .iter()
                    .map(|request| scope.spawn(move || self.provider.render(request)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .map_err(|_| anyhow!("render worker panicked"))
                            .and_then(|result| result)
                    })
                    .collect::<Result<Vec<_>>>()
            })?
        } else {
            requests
                .iter()
                .map(|request| self.provider.render(request))
                .collect::<Result<Vec<_>>>()?
        };

        let mut candidates = Vec::with_capacity(rendered.len());
        for (index, (request, image)) in requests.into_iter().zip(rendered).enumerate() {
            self.events.emit(
                "candidate_rendered",
                map_object(json!({
                    "round": round,
                    "index": index,
                    "prompt": request.prompt,
                    "image": image.image,
                    "width": image.width,
                    "height": image.height,
                    "provider": self.provider.name(),
                    "warnings": image.warnings,
                })),
            )?;
            candidates.push(Candidate {
                index,
                prompt: request.prompt,
                image: image.image,
            });
        }
        Ok(candidates)
    }

    /// The judge's improvement reason, or its raw reply unchanged when the reply is untagged.
    pub fn critique(&self, idea: &Idea, history: &RunHistory, chosen: &Candidate) -> Result<String> {
        let transcript = self
            .builder
            .critique(idea, history, &chosen.prompt, &chosen.image);
        let raw = ask_tagged(self.judge, &transcript, self.events)?;
        let (critique, parsed) = match tagged::extract_one(&raw) {
            Ok(reason) => (reason, true),
            Err(_) => (raw, false),
        };
        self.events.emit(
            "critique_written",
            map_object(json!({
                "round": history.len(),
                "parsed": parsed,
                "critique": critique,
            })),
        )?;
        Ok(critique)
    }

    fn render_request(&self, round: usize, idx: usize, prompt: &str) -> RenderRequest {
        RenderRequest {
            out_path: candidate_path(&self.candidate_dir, round, idx),
            prompt: prompt.to_string(),
            size: self.settings.size.clone(),
            strength: self.settings.strength,
            seed: self.settings.seed,
            model: self.settings.image_model.clone(),
            api_key: self.settings.api_key.clone(),
        }
    }
}

pub fn candidate_path(dir: &Path, round: usize, idx: usize) -> PathBuf {
    dir.join(format!("{round}_{idx}_0.png"))
}

/// Asks at the base temperature, then once more at [`FORMAT_RETRY_TEMPERATURE`] when the reply lacks delimiters.
pub fn ask_tagged(
    judge: &dyn Judge,
    transcript: &Transcript,
    events: &EventWriter,
) -> Result<String> {
    let first = judge.ask(transcript, BASE_TEMPERATURE)?;
    if tagged::has_delimiters(&first) {
        return Ok(first);
    }
    events.emit(
        "format_retry",
        map_object(json!({
            "request": transcript.request.label(),
            "temperature": FORMAT_RETRY_TEMPERATURE,
            "response": truncate_text(&first, 500),
        })),
    )?;
    Ok(judge.ask(transcript, FORMAT_RETRY_TEMPERATURE)?)
}

/// Truncates or pads parsed prompts to exactly `count` entries. Returns the number padded.
pub fn fit_prompts(output: TaggedOutput, count: usize) -> (Vec<String>, usize) {
    let mut prompts: Vec<String> = match output {
        TaggedOutput::Parsed(values) => values
            .into_iter()
            .filter(|value| !value.is_empty())
            .take(count)
            .collect(),
        TaggedOutput::Fallback(_) => Vec::new(),
    };
    let padded = count.saturating_sub(prompts.len());
    prompts.extend(std::iter::repeat(PLACEHOLDER_PROMPT.to_string()).take(padded));
    (prompts, padded)
}

/// Turns a ranking reply into a selection, falling back to a uniform random index.
pub fn resolve_selection<R: Rng + ?Sized>(raw: String, count: usize, rng: &mut R) -> SelectionResult {
    match tagged::extract_index(&raw, count) {
        Ok(index) => SelectionResult {
            index,
            rationale: raw,
            source: SelectionSource::Judge,
        },
        Err(reason) => random_selection(raw, count, reason, rng),
    }
}

fn random_selection<R: Rng + ?Sized>(
    raw: String,
    count: usize,
    reason: FallbackReason,
    rng: &mut R,
) -> SelectionResult {
    SelectionResult {
        index: rng.gen_range(0..count.max(1)),
        rationale: raw,
        source: SelectionSource::RandomFallback(reason),
    }
}

/// Best-of-N primitive shared by per-round and cross-round selection.
pub fn select_best<R: Rng + ?Sized>(
    judge: &dyn Judge,
    builder: &TranscriptBuilder,
    idea: &Idea,
    candidates: &[ImageRef],
    rng: &mut R,
    events: &EventWriter,
) -> Result<SelectionResult> {
    if candidates.is_empty() {
        bail!("cannot rank an empty candidate list");
    }
    if candidates.len() == 1 {
        return Ok(SelectionResult {
            index: 0,
            rationale: String::new(),
            source: SelectionSource::SingleCandidate,
        });
    }
    let transcript = builder.select_best(idea, candidates);
    let raw = ask_tagged(judge, &transcript, events)
        .with_context(|| format!("ranking {} candidates", candidates.len()))?;
    Ok(resolve_selection(raw, candidates.len(), rng))
}
