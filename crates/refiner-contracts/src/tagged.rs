use std::fmt;

use serde::{Deserialize, Serialize};

pub const START_TAG: &str = "<START>";
pub const END_TAG: &str = "<END>";

/// Why a judge response yielded no usable payload. Parsing never fails hard;
/// callers choose their own fallback from the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    MissingDelimiters,
    EmptyPayload,
    NotAnIndex,
    IndexOutOfRange,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FallbackReason::MissingDelimiters => "no <START>...<END> pair found",
            FallbackReason::EmptyPayload => "delimited payload is empty",
            FallbackReason::NotAnIndex => "payload is not a non-negative integer",
            FallbackReason::IndexOutOfRange => "index outside the candidate range",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaggedOutput {
    Parsed(Vec<String>),
    Fallback(FallbackReason),
}

impl TaggedOutput {
    pub fn values(&self) -> &[String] {
        match self {
            TaggedOutput::Parsed(values) => values,
            TaggedOutput::Fallback(_) => &[],
        }
    }
}

/// Both delimiters appear somewhere in the text. Used to decide on the format retry.
pub fn has_delimiters(text: &str) -> bool {
    text.contains(START_TAG) && text.contains(END_TAG)
}

/// Every payload enclosed by a start tag and the next end tag, trimmed.
///
/// A start tag without a closing end tag contributes nothing. When start tags
/// nest, the innermost one wins.
pub fn extract(text: &str) -> TaggedOutput {
    let values: Vec<String> = text
        .split(START_TAG)
        .skip(1)
        .filter_map(|chunk| chunk.find(END_TAG).map(|end| chunk[..end].trim().to_string()))
        .collect();
    if values.is_empty() {
        TaggedOutput::Fallback(FallbackReason::MissingDelimiters)
    } else {
        TaggedOutput::Parsed(values)
    }
}

/// First non-empty payload, if any.
pub fn extract_one(text: &str) -> Result<String, FallbackReason> {
    match extract(text) {
        TaggedOutput::Parsed(values) => values
            .into_iter()
            .find(|value| !value.is_empty())
            .ok_or(FallbackReason::EmptyPayload),
        TaggedOutput::Fallback(reason) => Err(reason),
    }
}

/// Single index payload validated against `0..count`.
pub fn extract_index(text: &str, count: usize) -> Result<usize, FallbackReason> {
    let payload = extract_one(text)?;
    if payload.is_empty() || !payload.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(FallbackReason::NotAnIndex);
    }
    let index: usize = payload
        .parse()
        .map_err(|_| FallbackReason::IndexOutOfRange)?;
    if index >= count {
        return Err(FallbackReason::IndexOutOfRange);
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::{extract, extract_index, extract_one, has_delimiters, FallbackReason, TaggedOutput};

    #[test]
    fn extract_collects_every_pair_in_order() {
        let text = "Sure!\n<START> first prompt <END>\nnoise\n<START>second<END> trailing";
        assert_eq!(
            extract(text),
            TaggedOutput::Parsed(vec!["first prompt".to_string(), "second".to_string()])
        );
    }

    #[test]
    fn extract_ignores_unclosed_start() {
        let text = "<START>kept<END> <START>dangling";
        assert_eq!(extract(text).values(), ["kept".to_string()]);
    }

    #[test]
    fn extract_reports_missing_delimiters() {
        assert_eq!(
            extract("no tags here"),
            TaggedOutput::Fallback(FallbackReason::MissingDelimiters)
        );
        assert!(!has_delimiters("<START> only"));
        assert!(has_delimiters("<START>x<END>"));
    }

    #[test]
    fn extract_one_skips_empty_payloads() {
        assert_eq!(extract_one("<START> <END><START>b<END>"), Ok("b".to_string()));
        assert_eq!(
            extract_one("<START>  <END>"),
            Err(FallbackReason::EmptyPayload)
        );
    }

    #[test]
    fn extract_index_validates_range_and_digits() {
        assert_eq!(extract_index("best is <START> 2 <END>", 3), Ok(2));
        assert_eq!(
            extract_index("<START>3<END>", 3),
            Err(FallbackReason::IndexOutOfRange)
        );
        assert_eq!(
            extract_index("<START>-1<END>", 3),
            Err(FallbackReason::NotAnIndex)
        );
        assert_eq!(
            extract_index("<START>image 1<END>", 3),
            Err(FallbackReason::NotAnIndex)
        );
        assert_eq!(
            extract_index("<START>99999999999999999999999<END>", 3),
            Err(FallbackReason::IndexOutOfRange)
        );
    }
}
