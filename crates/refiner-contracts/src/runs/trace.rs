use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::history::{RoundRecord, SelectionResult};

const RULE: &str = "===========";

/// Trace entry for one completed round of the run labelled `label`.
pub fn round_block(label: &str, record: &RoundRecord) -> String {
    format!(
        "{RULE}\nEnd of round {round}:\nuser_prompt: {label}\nimage_history: {image}\n\
         select_history: Round selection: {index}. || {rationale}\n\
         prompt_history: {prompt}\nreflection_history: {critique}\n{RULE}\n",
        round = record.round,
        image = record.image,
        index = record.selected_index,
        rationale = record.selection_rationale,
        prompt = record.prompt,
        critique = record.critique,
    )
}

pub fn final_block(final_round: usize, selection: &SelectionResult) -> String {
    format!(
        "Final selection: {final_round}. || {rationale}{RULE}\nFinal Selection: Round: {final_round}.\n{RULE}\n",
        rationale = selection.rationale,
    )
}

pub fn append_trace(path: &Path, block: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(block.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{append_trace, final_block, round_block};
    use crate::history::{RoundRecord, SelectionResult, SelectionSource};
    use crate::idea::ImageRef;

    #[test]
    fn trace_blocks_append_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("trace.txt");
        let record = RoundRecord {
            round: 0,
            prompt: "a red bicycle, dusk".to_string(),
            image: ImageRef::new("tmp/0_1_0.png"),
            selection_rationale: "image 1 wins <START>1<END>".to_string(),
            critique: "the wall is teal".to_string(),
            selected_index: 1,
        };
        append_trace(&path, &round_block("a red bicycle", &record))?;
        let selection = SelectionResult {
            index: 0,
            rationale: "<START>0<END>".to_string(),
            source: SelectionSource::Judge,
        };
        append_trace(&path, &final_block(0, &selection))?;

        let content = std::fs::read_to_string(&path)?;
        assert!(content.starts_with("===========\nEnd of round 0:\n"));
        assert!(content.contains("select_history: Round selection: 1. || image 1 wins"));
        assert!(content.contains("reflection_history: the wall is teal\n"));
        assert!(content.ends_with("Final Selection: Round: 0.\n===========\n"));
        Ok(())
    }
}
