//! Voice-command filter.
//!
//! Free text goes to an external classifier that decides whether it is an
//! unambiguous emergency directive. Blank input is rejected here and never
//! reaches the classifier.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::ClassifyError;

const SYSTEM_PROMPT: &str = "\
You decide whether a transcribed utterance is a clear emergency command.\n\
Output JSON: {\"isClear\": <true|false>, \"filteredSpeech\": \"<text>\"}\n\
A clear command unambiguously asks for emergency help, e.g. \"Call 911\", \"Emergency alert\", \"SOS\".\n\
If it is clear, return it unchanged as filteredSpeech.\n\
If it is unclear, garbled, a question, or about something else, set isClear to false and \
put a short clarification or a request to repeat in filteredSpeech.\n\n\
Example 1:\n\
Input: call 911\n\
{\"isClear\": true, \"filteredSpeech\": \"Call 911\"}\n\n\
Example 2:\n\
Input: what's the weather\n\
{\"isClear\": false, \"filteredSpeech\": \"That is not an emergency command. Say 'Call 911' to get help.\"}";

/// Wire shape of a classifier answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierReply {
    pub is_clear: bool,
    pub filtered_speech: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub is_clear: bool,
    pub normalized_text: String,
}

pub trait Classifier: Send + Sync {
    fn classify(&self, speech: &str) -> Result<ClassifierReply, ClassifyError>;
}

pub struct CommandFilter<C> {
    classifier: C,
}

impl<C: Classifier> CommandFilter<C> {
    pub fn new(classifier: C) -> Self {
        Self { classifier }
    }

    pub fn classify(&self, text: &str) -> Result<CommandResult, ClassifyError> {
        let speech = text.trim();
        if speech.is_empty() {
            return Err(ClassifyError::EmptyInput);
        }

        let reply = self.classifier.classify(speech)?;
        debug!(is_clear = reply.is_clear, filtered = %reply.filtered_speech, "command classified");
        Ok(CommandResult {
            is_clear: reply.is_clear,
            normalized_text: reply.filtered_speech.trim().to_string(),
        })
    }
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn classify(&self, speech: &str) -> Result<ClassifierReply, ClassifyError> {
        (**self).classify(speech)
    }
}

// ── LLM server backend ──────────────────────────────────────────────────────

/// Classifier backed by a llama.cpp-compatible `/completion` endpoint.
pub struct LlmClassifier {
    agent: ureq::Agent,
    base_url: String,
}

impl LlmClassifier {
    pub fn new(server_url: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        let agent = ureq::Agent::new_with_config(config);
        Self {
            agent,
            base_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    /// Probe the server. Unreachable is not fatal: each command will report the failure.
    pub fn probe(&self) -> bool {
        let health_url = format!("{}/health", self.base_url);
        match self.agent.get(&health_url).call() {
            Ok(_) => {
                info!(url = %self.base_url, "command classifier reachable");
                true
            }
            Err(e) => {
                warn!(url = %self.base_url, "command classifier not reachable ({e}), voice commands will fail");
                false
            }
        }
    }
}

impl Classifier for LlmClassifier {
    fn classify(&self, speech: &str) -> Result<ClassifierReply, ClassifyError> {
        let prompt = format!("{SYSTEM_PROMPT}\n\nInput: {speech}\nJSON:");
        let body = json!({
            "prompt": prompt,
            "n_predict": 128,
            "temperature": 0.0,
            "top_k": 1,
            "stop": ["\nInput:", "\n\n"]
        });

        let url = format!("{}/completion", self.base_url);
        let response = self
            .agent
            .post(&url)
            .send_json(&body)
            .map_err(|e| ClassifyError::Failed(format!("request failed: {e}")))?;

        let resp_body: serde_json::Value = response
            .into_body()
            .read_json()
            .map_err(|e| ClassifyError::Failed(format!("response parse error: {e}")))?;

        let content = resp_body["content"].as_str().unwrap_or("").trim();
        debug!(%content, "classifier raw output");
        extract_reply(content)
            .ok_or_else(|| ClassifyError::Failed(format!("could not parse classifier output: {content}")))
    }
}

/// Parse the model's JSON answer; the stop sequence may have eaten the closing brace.
pub fn extract_reply(content: &str) -> Option<ClassifierReply> {
    let content = content.trim();
    if let Ok(reply) = serde_json::from_str::<ClassifierReply>(content) {
        return Some(reply);
    }
    let with_brace = format!("{}}}", content.trim_end_matches('}'));
    serde_json::from_str::<ClassifierReply>(&with_brace).ok()
}

// ── Offline backend ─────────────────────────────────────────────────────────

/// Phrases that are a request for help wherever they appear in the utterance.
const CLEAR_DIRECTIVES: &[&str] = &[
    "call 911",
    "call 112",
    "call 999",
    "call an ambulance",
    "call for help",
    "emergency alert",
    "help me",
    "i need help",
    "i fell",
];

/// Single words that only count when they are the whole utterance.
const BARE_DIRECTIVES: &[&str] = &["sos", "emergency", "help"];

const NEGATIONS: &[&str] = &["not", "no", "don't", "dont", "never", "isn't", "isnt"];

const REPHRASE_HINT: &str = "Command unclear. Say \"Call 911\", \"SOS\" or \"Emergency alert\" to get help.";

/// Keyword matcher used when no classifier server is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    fn is_directive(words: &[String]) -> bool {
        if let [only] = words {
            if BARE_DIRECTIVES.contains(&only.as_str()) {
                return true;
            }
        }

        // Earliest word index at which a directive phrase starts.
        let found = CLEAR_DIRECTIVES
            .iter()
            .filter_map(|directive| {
                let phrase: Vec<&str> = directive.split(' ').collect();
                words
                    .windows(phrase.len())
                    .position(|window| window.iter().zip(&phrase).all(|(w, p)| w == p))
            })
            .min();

        match found {
            Some(at) => !words[..at].iter().any(|w| NEGATIONS.contains(&w.as_str())),
            None => false,
        }
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, speech: &str) -> Result<ClassifierReply, ClassifyError> {
        let words: Vec<String> = speech
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect();

        let is_clear = Self::is_directive(&words);
        let filtered_speech = if is_clear {
            speech.to_string()
        } else {
            REPHRASE_HINT.to_string()
        };
        Ok(ClassifierReply {
            is_clear,
            filtered_speech,
        })
    }
}
