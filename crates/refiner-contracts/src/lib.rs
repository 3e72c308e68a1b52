pub mod events;
pub mod history;
pub mod idea;
pub mod models;
pub mod runs;
pub mod tagged;
pub mod transcript;

pub use history::{RoundRecord, RunHistory, SelectionResult, SelectionSource};
pub use idea::{Idea, IdeaSegment, ImageRef, IMAGE_PLACEHOLDER};
pub use transcript::{ContentPart, ImageDetail, JudgeRequest, Message, Role, Transcript};
