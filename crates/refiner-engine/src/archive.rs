use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use refiner_contracts::runs::summary::{write_summary, RunSummary};
use refiner_contracts::runs::trace::{append_trace, final_block, round_block};
use refiner_contracts::{Idea, ImageRef, RoundRecord, SelectionResult};
use serde_json::{Map, Value};

/// On-disk layout for one idea's run under an output root.
///
/// ```text
/// {root}/tmp/{slug}/{round}_{idx}_0.png   candidates
/// {root}/tmp/{slug}/summary.json
/// {root}/tmp/{slug}.txt                   trace log
/// {root}/round1/{slug}.png                round 0 selection
/// {root}/iter/{slug}.png                  last round selection
/// {root}/iter_best/{slug}/{final}.png     global selection
/// ```
#[derive(Debug, Clone)]
pub struct RunArchive {
    root: PathBuf,
    slug: String,
    label: String,
    final_name: String,
}

impl RunArchive {
    pub fn new(root: impl Into<PathBuf>, idea: &Idea, final_name: impl Into<String>) -> Self {
        let final_name = final_name.into();
        Self {
            root: root.into(),
            slug: idea.slug(),
            label: idea.label().to_string(),
            final_name: if final_name.trim().is_empty() {
                "image".to_string()
            } else {
                final_name.trim().to_string()
            },
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn candidate_dir(&self) -> PathBuf {
        self.root.join("tmp").join(&self.slug)
    }

    pub fn trace_path(&self) -> PathBuf {
        self.root.join("tmp").join(format!("{}.txt", self.slug))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.candidate_dir().join("summary.json")
    }

    pub fn first_round_path(&self) -> PathBuf {
        self.root.join("round1").join(format!("{}.png", self.slug))
    }

    pub fn last_round_path(&self) -> PathBuf {
        self.root.join("iter").join(format!("{}.png", self.slug))
    }

    pub fn final_path(&self) -> PathBuf {
        self.root
            .join("iter_best")
            .join(&self.slug)
            .join(format!("{}.png", self.final_name))
    }

    /// Creates the directory tree and starts a fresh trace log.
    pub fn prepare(&self) -> Result<()> {
        for dir in [
            self.candidate_dir(),
            self.root.join("round1"),
            self.root.join("iter"),
            self.root.join("iter_best").join(&self.slug),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        fs::write(self.trace_path(), "")
            .with_context(|| format!("failed to reset {}", self.trace_path().display()))?;
        Ok(())
    }

    pub fn record_round(&self, record: &RoundRecord) -> Result<()> {
        append_trace(&self.trace_path(), &round_block(&self.label, record))?;
        if record.round == 0 {
            copy_image(&record.image, &self.first_round_path())?;
        }
        Ok(())
    }

    pub fn record_last_round(&self, record: &RoundRecord) -> Result<()> {
        copy_image(&record.image, &self.last_round_path())
    }

    /// Appends the final trace block and copies the chosen image. Returns the archived path.
    pub fn record_final(
        &self,
        final_round: usize,
        selection: &SelectionResult,
        image: &ImageRef,
    ) -> Result<PathBuf> {
        append_trace(&self.trace_path(), &final_block(final_round, selection))?;
        let target = self.final_path();
        copy_image(image, &target)?;
        Ok(target)
    }

    pub fn write_summary(&self, summary: &RunSummary, extra: Option<&Map<String, Value>>) -> Result<()> {
        write_summary(&self.summary_path(), summary, extra)
    }
}

fn copy_image(image: &ImageRef, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(image.path(), target).with_context(|| {
        format!("failed to copy {} to {}", image, target.display())
    })?;
    Ok(())
}
