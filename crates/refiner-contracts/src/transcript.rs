use serde::{Deserialize, Serialize};

use crate::idea::ImageRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    #[default]
    Low,
    High,
    Auto,
}

impl ImageDetail {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageDetail::Low => "low",
            ImageDetail::High => "high",
            ImageDetail::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image: ImageRef, detail: ImageDetail },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(image: ImageRef, detail: ImageDetail) -> Self {
        ContentPart::Image { image, detail }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            ContentPart::Image { .. } => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageRef> {
        match self {
            ContentPart::Image { image, .. } => Some(image),
            ContentPart::Text { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            content: Vec::new(),
        }
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        self.content.push(ContentPart::text(text));
    }

    pub fn push_image(&mut self, image: ImageRef, detail: ImageDetail) {
        self.content.push(ContentPart::image(image, detail));
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(ContentPart::as_text)
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageRef> {
        self.content.iter().filter_map(ContentPart::as_image)
    }
}

/// What a transcript asks the judge for.
///
/// Carried alongside the messages for logging and offline judges; never sent to the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JudgeRequest {
    Prompts { count: usize },
    SelectBest { candidates: usize },
    Critique { round: usize },
}

impl JudgeRequest {
    pub fn label(&self) -> &'static str {
        match self {
            JudgeRequest::Prompts { .. } => "prompts",
            JudgeRequest::SelectBest { .. } => "select_best",
            JudgeRequest::Critique { .. } => "critique",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub request: JudgeRequest,
    pub messages: Vec<Message>,
}

impl Transcript {
    pub fn new(request: JudgeRequest, system: Message, user: Message) -> Self {
        Self {
            request,
            messages: vec![system, user],
        }
    }

    pub fn system(&self) -> Option<&Message> {
        self.messages.iter().find(|message| message.role == Role::System)
    }

    pub fn user(&self) -> Option<&Message> {
        self.messages.iter().find(|message| message.role == Role::User)
    }

    pub fn image_count(&self) -> usize {
        self.messages.iter().map(|message| message.images().count()).sum()
    }

    /// Concatenated text of every part, in order. Images are skipped.
    pub fn flatten_text(&self) -> String {
        self.messages
            .iter()
            .flat_map(|message| message.texts())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
