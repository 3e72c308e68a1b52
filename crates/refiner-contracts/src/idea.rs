use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Token that splits an idea line into alternating text and image-path segments.
pub const IMAGE_PLACEHOLDER: &str = "<IMG>";

/// Opaque reference to an image on disk. The engine never mutates the file it points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(PathBuf);

impl ImageRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for ImageRef {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IdeaSegment {
    Text(String),
    Image(ImageRef),
}

/// The immutable scene description a run refines towards.
///
/// The first segment is always text; it doubles as the run's human-readable label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Idea {
    segments: Vec<IdeaSegment>,
}

impl Idea {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            segments: vec![IdeaSegment::Text(text.into())],
        }
    }

    pub fn from_segments(segments: Vec<IdeaSegment>) -> anyhow::Result<Self> {
        match segments.first() {
            Some(IdeaSegment::Text(_)) => Ok(Self { segments }),
            Some(IdeaSegment::Image(_)) => bail!("idea must start with a text segment"),
            None => bail!("idea has no segments"),
        }
    }

    /// Parses one input line. Odd-indexed pieces around [`IMAGE_PLACEHOLDER`] are image paths.
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            bail!("idea line is empty");
        }
        let segments = trimmed
            .split(IMAGE_PLACEHOLDER)
            .enumerate()
            .map(|(idx, piece)| {
                if idx % 2 == 1 {
                    IdeaSegment::Image(ImageRef::new(piece.trim()))
                } else {
                    IdeaSegment::Text(piece.to_string())
                }
            })
            .collect();
        Self::from_segments(segments)
    }

    pub fn segments(&self) -> &[IdeaSegment] {
        &self.segments
    }

    pub fn label(&self) -> &str {
        match self.segments.first() {
            Some(IdeaSegment::Text(text)) => text.trim(),
            _ => "",
        }
    }

    /// The idea in its input-line form, images wrapped in [`IMAGE_PLACEHOLDER`].
    pub fn line(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                IdeaSegment::Text(text) => text.clone(),
                IdeaSegment::Image(image) => {
                    format!("{IMAGE_PLACEHOLDER}{image}{IMAGE_PLACEHOLDER}")
                }
            })
            .collect::<String>()
            .trim()
            .to_string()
    }

    /// File-name friendly label: spaces and dots removed.
    pub fn slug(&self) -> String {
        let slug: String = self
            .label()
            .chars()
            .filter(|ch| *ch != ' ' && *ch != '.' && *ch != '/' && *ch != '\\')
            .collect();
        if slug.is_empty() {
            "idea".to_string()
        } else {
            slug
        }
    }

    pub fn reference_images(&self) -> impl Iterator<Item = &ImageRef> {
        self.segments.iter().filter_map(|segment| match segment {
            IdeaSegment::Image(image) => Some(image),
            IdeaSegment::Text(_) => None,
        })
    }
}
