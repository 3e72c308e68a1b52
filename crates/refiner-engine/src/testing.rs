use std::sync::Mutex;

use refiner_contracts::{JudgeRequest, Transcript};

use crate::judge::Judge;
use crate::retry::OracleError;

type Reply = Box<dyn Fn(&Transcript) -> String + Send + Sync>;

/// Judge with canned replies per request kind. Records every call.
pub(crate) struct ScriptedJudge {
    prompts: Reply,
    select: Reply,
    critique: Reply,
    calls: Mutex<Vec<(Transcript, f64)>>,
}

impl ScriptedJudge {
    pub(crate) fn new() -> Self {
        Self {
            prompts: Box::new(|transcript: &Transcript| match transcript.request {
                JudgeRequest::Prompts { count } => (0..count)
                    .map(|idx| format!("<START>scripted prompt {idx}<END>"))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            }),
            select: Box::new(|transcript: &Transcript| match transcript.request {
                JudgeRequest::SelectBest { candidates } if candidates > 1 => {
                    "Second looks closest. <START>1<END>".to_string()
                }
                _ => "<START>0<END>".to_string(),
            }),
            critique: Box::new(|transcript: &Transcript| match transcript.request {
                JudgeRequest::Critique { round } => {
                    format!("<START>the bicycle in round {round} should be red<END>")
                }
                _ => String::new(),
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_prompts(
        mut self,
        reply: impl Fn(&Transcript) -> String + Send + Sync + 'static,
    ) -> Self {
        self.prompts = Box::new(reply);
        self
    }

    pub(crate) fn with_select(
        mut self,
        reply: impl Fn(&Transcript) -> String + Send + Sync + 'static,
    ) -> Self {
        self.select = Box::new(reply);
        self
    }

    pub(crate) fn with_critique(
        mut self,
        reply: impl Fn(&Transcript) -> String + Send + Sync + 'static,
    ) -> Self {
        self.critique = Box::new(reply);
        self
    }

    pub(crate) fn requests(&self) -> Vec<JudgeRequest> {
        self.calls()
            .into_iter()
            .map(|(transcript, _)| transcript.request)
            .collect()
    }

    pub(crate) fn transcripts(&self) -> Vec<Transcript> {
        self.calls()
            .into_iter()
            .map(|(transcript, _)| transcript)
            .collect()
    }

    pub(crate) fn temperatures(&self) -> Vec<f64> {
        self.calls()
            .into_iter()
            .map(|(_, temperature)| temperature)
            .collect()
    }

    fn calls(&self) -> Vec<(Transcript, f64)> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

impl Judge for ScriptedJudge {
    fn name(&self) -> &str {
        "scripted"
    }

    fn ask(&self, transcript: &Transcript, temperature: f64) -> Result<String, OracleError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((transcript.clone(), temperature));
        }
        let reply = match transcript.request {
            JudgeRequest::Prompts { .. } => &self.prompts,
            JudgeRequest::SelectBest { .. } => &self.select,
            JudgeRequest::Critique { .. } => &self.critique,
        };
        Ok(reply(transcript))
    }
}
