use refiner_contracts::{
    ContentPart, Idea, IdeaSegment, ImageDetail, ImageRef, JudgeRequest, Message, Role,
    RoundRecord, RunHistory, Transcript,
};

pub const IDEA_SENTINEL: &str = "End of IDEA.\n";

const ASSISTANT_PREAMBLE: &str = "You are a helpful assistant.\n\n";

const PROMPT_TASK: &str = "Instruction: Given a user imagined IDEA of the scene, converting the IDEA into a self-contained sentence prompt that will be used to generate an image.\n";

const PROMPT_RULES_HEADER: &str = "Here are some rules to write good prompts:\n";

const PROMPT_RULES: &str = "- Each prompt should consist of a description of the scene followed by modifiers divided by commas.\n\
- The modifiers should alter the mood, style, lighting, spatial details, and other aspects of the scene.\n\
- Multiple modifiers can be used to provide more specific details.\n\
- When generating prompts, reduce abstract psychological and emotional descriptions.\n\
- When generating prompts, explain images and unusual entities in IDEA with detailed descriptions of the scene.\n\
- Do not mention 'given image' in output, use detailed texts to describe the image in IDEA instead.\n\
- Generate diverse prompts.\n\
- Each prompt should have no more than 50 words.\n";

const CRITIQUE_TASK: &str = "You are iteratively refining the sentence prompt by analyzing the images produced by an AI art generation model, seeking to find out the differences between the user imagined IDEA of the scene and the actual output.\n";

const CRITIQUE_RULES_HEADER: &str = "If the generated image is not perfect, provide key REASON on ways to improve the image and sentence prompt to better follow the user imagined IDEA of the scene. Here are some rules to write good key REASON:\n";

const CRITIQUE_RULES: &str = "- Carefully compare the current image with the IDEA to strictly follow the details described in the IDEA, including object counts, attributes, entities, relationships, sizes, and appearance. Write down what is different in detail.\n\
- Avoid hallucinating information or asks that is not mentioned in IDEA.\n\
- Explain images and unusual entities in IDEA with detailed text descriptions of the scene.\n\
- Explain how to modify prompts to address the given reflection reason.\n\
- Focus on one thing to improve in each REASON.\n\
- Avoid generating REASON identical with the REASON in previous rounds.\n";

const IMAGE_CAPTION: &str = "Corresponding image generated by the AI art generation model:";

/// Builds transcripts for prompt generation, ranking and critique.
///
/// System messages carry only static instructions. User messages hold the idea
/// segments, then the end-of-idea sentinel, then call-specific content, and end
/// with an instruction naming the `<START>`/`<END>` output format.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptBuilder {
    detail: ImageDetail,
}

impl TranscriptBuilder {
    pub fn new(detail: ImageDetail) -> Self {
        Self { detail }
    }

    /// Round 0: N prompts straight from the idea.
    pub fn initial_prompts(&self, idea: &Idea, count: usize) -> Transcript {
        let system = prompt_writer_system();
        let mut user = self.idea_message(idea);
        user.push_text(format!(
            "Based on the above information, you will write {count} detailed prompts exactly about the IDEA follow the rules. Each prompt is wrapped with <START> and <END>.\n"
        ));
        Transcript::new(JudgeRequest::Prompts { count }, system, user)
    }

    /// Later rounds: N new prompts informed by every completed round.
    pub fn revised_prompts(&self, idea: &Idea, history: &RunHistory, count: usize) -> Transcript {
        let system = prompt_writer_system();
        let mut user = self.idea_message(idea);
        user.push_text(
            "You are iteratively improving the sentence prompt by looking at the images generated by an AI art generation model and find out what is different from the given IDEA.\n",
        );
        user.push_text(round_banner(history.len() + 1));
        self.push_history(&mut user, history.records());
        user.push_text(format!(
            "Based on the above information, to improve the image, you will write {count} detailed prompts exactly about the IDEA follow the rules. Make description of the scene more detailed and add modifiers to address the given key reasons to improve the image, especially the most recent one. Avoid generating prompts identical with the ones in previous rounds. Each prompt is wrapped with <START> and <END>.\n"
        ));
        Transcript::new(JudgeRequest::Prompts { count }, system, user)
    }

    /// Best-of-N ranking over `candidates`, each prefixed with its index.
    pub fn select_best(&self, idea: &Idea, candidates: &[ImageRef]) -> Transcript {
        let count = candidates.len();
        let last = count.saturating_sub(1);
        let mut system = Message::new(Role::System);
        system.push_text(format!(
            "{ASSISTANT_PREAMBLE}You are a judge to rank provided images. Below are {count} images generated by an AI art generation model, indexed from 0 to {last}."
        ));
        system.push_text(
            "From scale 1 to 10, decide how similar each image is to the user imagined IDEA of the scene.",
        );

        let mut user = self.idea_message(idea);
        for (idx, image) in candidates.iter().enumerate() {
            user.push_text(format!("{idx}. "));
            user.push_image(image.clone(), self.detail);
        }
        user.push_text(format!(
            "Let's think step by step. Check all aspects to see how well these images strictly follow the content in IDEA, including having correct object counts, attributes, entities, relationships, sizes, appearance, and all other descriptions in the IDEA. Then give a score for each input images. Finally, consider the scores and select the image with the best overall quality with image index 0 to {last} wrapped with <START> and <END>. Only wrap single image index digits between <START> and <END>."
        ));
        Transcript::new(JudgeRequest::SelectBest { candidates: count }, system, user)
    }

    /// One improvement reason for the candidate just selected in round `history.len()`.
    pub fn critique(
        &self,
        idea: &Idea,
        history: &RunHistory,
        prompt: &str,
        image: &ImageRef,
    ) -> Transcript {
        let round = history.len();
        let mut system = Message::new(Role::System);
        system.push_text(format!("{ASSISTANT_PREAMBLE}{CRITIQUE_TASK}"));
        system.push_text(CRITIQUE_RULES_HEADER);
        system.push_text(CRITIQUE_RULES);

        let mut user = self.idea_message(idea);
        user.push_text(round_banner(round + 1));
        self.push_history(&mut user, history.records());
        user.push_text(format!(
            "Generated sentence prompt for current round {} is: {prompt}\n{IMAGE_CAPTION}",
            round + 1
        ));
        user.push_image(image.clone(), self.detail);
        user.push_text(
            "Based on the above information, you will write REASON that is wrapped with <START> and <END>.\n REASON: ",
        );
        Transcript::new(JudgeRequest::Critique { round }, system, user)
    }

    fn idea_message(&self, idea: &Idea) -> Message {
        let mut user = Message::new(Role::User);
        user.content.extend(self.idea_parts(idea));
        user.push_text(IDEA_SENTINEL);
        user
    }

    fn idea_parts(&self, idea: &Idea) -> Vec<ContentPart> {
        idea.segments()
            .iter()
            .enumerate()
            .map(|(idx, segment)| match segment {
                IdeaSegment::Text(text) if idx == 0 => ContentPart::text(format!("IDEA: {text}.")),
                IdeaSegment::Text(text) => ContentPart::text(text.clone()),
                IdeaSegment::Image(image) => ContentPart::image(image.clone(), self.detail),
            })
            .collect()
    }

    fn push_history(&self, user: &mut Message, records: &[RoundRecord]) {
        if records.is_empty() {
            return;
        }
        user.push_text("The iteration history are:\n");
        for record in records {
            user.push_text(recap_heading(record));
            user.push_image(record.image.clone(), self.detail);
            user.push_text(format!("However, {}.", record.critique));
        }
    }
}

fn prompt_writer_system() -> Message {
    let mut system = Message::new(Role::System);
    system.push_text(format!("{ASSISTANT_PREAMBLE}{PROMPT_TASK}"));
    system.push_text(PROMPT_RULES_HEADER);
    system.push_text(PROMPT_RULES);
    system
}

fn round_banner(round_number: usize) -> String {
    format!("This is the round {round_number} of the iteration.\n")
}

/// Text that opens the recap of a completed round. Rounds are numbered from 1.
pub fn recap_heading(record: &RoundRecord) -> String {
    format!(
        "Round {}:\nGenerated sentence prompt: {}\n{IMAGE_CAPTION}",
        record.round + 1,
        record.prompt
    )
}
