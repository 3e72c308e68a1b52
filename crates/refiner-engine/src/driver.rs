use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use refiner_contracts::events::EventWriter;
use refiner_contracts::runs::summary::RunSummary;
use refiner_contracts::{Idea, ImageDetail, RunHistory, SelectionResult};
use serde_json::json;

use crate::archive::RunArchive;
use crate::judge::Judge;
use crate::prompts::TranscriptBuilder;
use crate::providers::ImageProvider;
use crate::round::{select_best, RoundController, RoundReport, RoundSettings};
use crate::{map_object, now_utc_iso, truncate_text};

#[derive(Debug, Clone)]
pub struct RefineConfig {
    pub num_prompts: usize,
    pub max_rounds: usize,
    pub images_per_prompt: usize,
    pub strength: f64,
    pub size: String,
    /// Leading rounds excluded from the global selection.
    pub start_offset: usize,
    pub image_model: String,
    pub api_key: Option<String>,
    pub seed: Option<u64>,
    pub parallel_render: bool,
    pub detail: ImageDetail,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            num_prompts: 3,
            max_rounds: 3,
            images_per_prompt: 1,
            strength: 1.0,
            size: "1024x1024".to_string(),
            start_offset: 0,
            image_model: "dryrun-image-1".to_string(),
            api_key: None,
            seed: None,
            parallel_render: false,
            detail: ImageDetail::Low,
        }
    }
}

impl RefineConfig {
    /// Rejects unusable values and clamps recoverable ones. Returns one warning per clamp.
    pub fn validate(&mut self) -> Result<Vec<String>> {
        if self.num_prompts == 0 {
            bail!("num_prompts must be at least 1");
        }
        if self.max_rounds == 0 {
            bail!("max_rounds must be at least 1");
        }
        if self.images_per_prompt != 1 {
            bail!(
                "only one image per prompt is supported (got {})",
                self.images_per_prompt
            );
        }
        if !(0.0..=1.0).contains(&self.strength) {
            bail!("strength must be within [0, 1] (got {})", self.strength);
        }
        let mut warnings = Vec::new();
        if self.start_offset >= self.max_rounds {
            warnings.push(format!(
                "start_offset {} is not below max_rounds {}; using 0",
                self.start_offset, self.max_rounds
            ));
            self.start_offset = 0;
        }
        Ok(warnings)
    }

    fn round_settings(&self) -> RoundSettings {
        RoundSettings {
            num_prompts: self.num_prompts,
            images_per_prompt: self.images_per_prompt,
            strength: self.strength,
            size: self.size.clone(),
            image_model: self.image_model.clone(),
            api_key: self.api_key.clone(),
            seed: self.seed,
            parallel_render: self.parallel_render,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub history: RunHistory,
    pub rounds: Vec<RoundReport>,
    pub global: SelectionResult,
    /// Index into `history`, offset already re-added.
    pub final_round: usize,
    pub final_image: PathBuf,
    pub effective_start_offset: usize,
}

/// Runs the fixed number of rounds for one idea, then picks the best round.
pub struct RunDriver<'a> {
    judge: &'a dyn Judge,
    provider: &'a dyn ImageProvider,
    config: RefineConfig,
    events: EventWriter,
}

impl<'a> RunDriver<'a> {
    pub fn new(
        judge: &'a dyn Judge,
        provider: &'a dyn ImageProvider,
        config: RefineConfig,
        events: EventWriter,
    ) -> Self {
        Self {
            judge,
            provider,
            config,
            events,
        }
    }

    pub fn run(&self, idea: &Idea, archive: &RunArchive) -> Result<RunOutcome> {
        match self.run_inner(idea, archive) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let _ = self.events.emit(
                    "run_failed",
                    map_object(json!({
                        "idea": idea.label(),
                        "error": format!("{err:#}"),
                    })),
                );
                Err(err)
            }
        }
    }

    fn run_inner(&self, idea: &Idea, archive: &RunArchive) -> Result<RunOutcome> {
        let mut config = self.config.clone();
        for warning in config.validate()? {
            self.events.emit(
                "config_warning",
                map_object(json!({"message": warning})),
            )?;
        }
        archive.prepare()?;
        let started_at = now_utc_iso();
        self.events.emit(
            "run_started",
            map_object(json!({
                "idea": idea.label(),
                "slug": archive.slug(),
                "judge": self.judge.name(),
                "provider": self.provider.name(),
                "num_prompts": config.num_prompts,
                "max_rounds": config.max_rounds,
                "start_offset": config.start_offset,
                "seed": config.seed,
            })),
        )?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let builder = TranscriptBuilder::new(config.detail);
        let settings = config.round_settings();
        let controller = RoundController::new(
            self.judge,
            self.provider,
            builder,
            &settings,
            &self.events,
            archive.candidate_dir(),
        );

        let mut history = RunHistory::new();
        let mut rounds = Vec::with_capacity(config.max_rounds);
        for round in 0..config.max_rounds {
            let terminal = round + 1 == config.max_rounds;
            let report = controller
                .run(idea, &mut history, terminal, &mut rng)
                .with_context(|| format!("round {round} failed"))?;
            if let Some(record) = history.latest() {
                archive.record_round(record)?;
            }
            rounds.push(report);
        }
        let last = history
            .latest()
            .ok_or_else(|| anyhow!("run finished without rounds"))?;
        archive.record_last_round(last)?;

        let offset = config.start_offset;
        let pool = history.selected_images_from(offset);
        let global = select_best(self.judge, &builder, idea, &pool, &mut rng, &self.events)
            .context("global selection failed")?;
        let final_round = global.index + offset;
        let chosen = history
            .get(final_round)
            .ok_or_else(|| anyhow!("global selection {final_round} outside run history"))?;
        self.events.emit(
            "global_selection",
            map_object(json!({
                "start_offset": offset,
                "pool": pool.len(),
                "index": global.index,
                "final_round": final_round,
                "source": global.source.label(),
                "fallback_reason": global.source.fallback_reason(),
                "rationale": truncate_text(&global.rationale, 2000),
            })),
        )?;
        let final_image = archive.record_final(final_round, &global, &chosen.image)?;

        let total_candidates: usize = rounds.iter().map(|report| report.candidates.len()).sum();
        let summary = RunSummary {
            run_id: self.events.run_id().to_string(),
            idea: idea.line(),
            started_at,
            finished_at: now_utc_iso(),
            total_rounds: rounds.len() as u64,
            total_candidates: total_candidates as u64,
            final_round,
            final_image: final_image.to_string_lossy().to_string(),
            global_selection: global.clone(),
            history: history.clone(),
        };
        archive.write_summary(
            &summary,
            Some(&map_object(json!({
                "judge": self.judge.name(),
                "provider": self.provider.name(),
                "start_offset": offset,
            }))),
        )?;
        self.events.emit(
            "run_finished",
            map_object(json!({
                "final_round": final_round,
                "final_image": final_image,
                "summary": archive.summary_path(),
            })),
        )?;

        Ok(RunOutcome {
            run_id: self.events.run_id().to_string(),
            history,
            rounds,
            global,
            final_round,
            final_image,
            effective_start_offset: offset,
        })
    }
}
