use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::idea::ImageRef;
use crate::tagged::FallbackReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "reason", rename_all = "snake_case")]
pub enum SelectionSource {
    Judge,
    /// Only one candidate; the judge was not asked.
    SingleCandidate,
    RandomFallback(FallbackReason),
}

impl SelectionSource {
    pub fn label(&self) -> &'static str {
        match self {
            SelectionSource::Judge => "judge",
            SelectionSource::SingleCandidate => "single_candidate",
            SelectionSource::RandomFallback(_) => "random_fallback",
        }
    }

    pub fn fallback_reason(&self) -> Option<FallbackReason> {
        match self {
            SelectionSource::RandomFallback(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Outcome of one best-of-N ranking. `index` is always inside the candidate range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub index: usize,
    pub rationale: String,
    #[serde(flatten)]
    pub source: SelectionSource,
}

impl SelectionResult {
    pub fn is_fallback(&self) -> bool {
        matches!(self.source, SelectionSource::RandomFallback(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: usize,
    pub prompt: String,
    pub image: ImageRef,
    pub selection_rationale: String,
    /// Empty on the terminal round.
    pub critique: String,
    pub selected_index: usize,
}

/// Append-only record of the completed rounds of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistory {
    records: Vec<RoundRecord>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rounds must arrive in order: the record's index equals the current length.
    pub fn append(&mut self, record: RoundRecord) -> anyhow::Result<()> {
        if record.round != self.records.len() {
            bail!(
                "round {} appended out of order (expected round {})",
                record.round,
                self.records.len()
            );
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[RoundRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, round: usize) -> Option<&RoundRecord> {
        self.records.get(round)
    }

    pub fn latest(&self) -> Option<&RoundRecord> {
        self.records.last()
    }

    /// Selected images from `start` onwards, for cross-round ranking.
    pub fn selected_images_from(&self, start: usize) -> Vec<ImageRef> {
        self.records
            .iter()
            .skip(start)
            .map(|record| record.image.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{RoundRecord, RunHistory, SelectionResult, SelectionSource};
    use crate::idea::ImageRef;
    use crate::tagged::FallbackReason;

    fn record(round: usize) -> RoundRecord {
        RoundRecord {
            round,
            prompt: format!("prompt {round}"),
            image: ImageRef::new(format!("{round}_0_0.png")),
            selection_rationale: "<START>0<END>".to_string(),
            critique: format!("critique {round}"),
            selected_index: 0,
        }
    }

    #[test]
    fn append_enforces_round_order() -> anyhow::Result<()> {
        let mut history = RunHistory::new();
        history.append(record(0))?;
        assert!(history.append(record(2)).is_err());
        history.append(record(1))?;
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().map(|r| r.round), Some(1));
        Ok(())
    }

    #[test]
    fn selected_images_from_skips_leading_rounds() -> anyhow::Result<()> {
        let mut history = RunHistory::new();
        for round in 0..3 {
            history.append(record(round))?;
        }
        let images = history.selected_images_from(1);
        assert_eq!(
            images,
            vec![ImageRef::new("1_0_0.png"), ImageRef::new("2_0_0.png")]
        );
        assert!(history.selected_images_from(5).is_empty());
        Ok(())
    }

    #[test]
    fn selection_source_serializes_flat() -> anyhow::Result<()> {
        let judged = SelectionResult {
            index: 2,
            rationale: "<START>2<END>".to_string(),
            source: SelectionSource::Judge,
        };
        assert_eq!(
            serde_json::to_value(&judged)?,
            json!({"index": 2, "rationale": "<START>2<END>", "source": "judge"})
        );

        let fallback = SelectionResult {
            index: 0,
            rationale: "no idea".to_string(),
            source: SelectionSource::RandomFallback(FallbackReason::MissingDelimiters),
        };
        let value = serde_json::to_value(&fallback)?;
        assert_eq!(value["source"], json!("random_fallback"));
        assert_eq!(value["reason"], json!("missing_delimiters"));
        assert_eq!(serde_json::from_value::<SelectionResult>(value)?, fallback);
        assert!(fallback.is_fallback());
        assert_eq!(
            fallback.source.fallback_reason(),
            Some(FallbackReason::MissingDelimiters)
        );
        Ok(())
    }
}
