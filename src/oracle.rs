use std::time::Duration;

use serde_json::json;

use crate::models::EntityKind;
use crate::settings::Settings;

// ---------------------------------------------------------------------------
// Oracle capability
// ---------------------------------------------------------------------------

/// Best-effort semantic completion, consulted only after the dictionary and
/// fuzzy passes miss. Untrusted and never required for correctness: every
/// failure mode collapses to `None` and the cascade falls through.
pub trait NameOracle {
    /// Suggest a canonical spelling for a cleaned entity name.
    fn suggest(&self, kind: EntityKind, text: &str) -> Option<String>;

    /// Classify a line-item text, answering with exactly one of
    /// 商品 / 作業 / 不明.
    fn classify_item(&self, text: &str) -> Option<String>;
}

/// Disabled oracle: the cascade behaves as if the service never answers.
pub struct NullOracle;

impl NameOracle for NullOracle {
    fn suggest(&self, _kind: EntityKind, _text: &str) -> Option<String> {
        None
    }

    fn classify_item(&self, _text: &str) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Chat-completion oracle
// ---------------------------------------------------------------------------

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const SYSTEM_PROMPT: &str = "あなたは会計帳簿の表記揺れを正規化するアシスタントです。";

pub struct ChatOracle {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
}

impl ChatOracle {
    /// Returns `None` when no credential is configured; callers fall back to
    /// `NullOracle` and the pipeline keeps flowing.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let api_key = settings.oracle_api_key()?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .ok()?;
        Some(Self {
            client,
            api_key,
            model: settings.oracle_model.clone(),
        })
    }

    fn chat(&self, prompt: &str, max_tokens: u32) -> Option<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": 0,
            "max_tokens": max_tokens,
        });
        let response = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .ok()?;
        if !response.status().is_success() {
            log::warn!("oracle request failed: {}", response.status());
            return None;
        }
        let value: serde_json::Value = response.json().ok()?;
        let content = value
            .get("choices")?
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()?
            .trim()
            .to_string();
        if content.is_empty() {
            None
        } else {
            Some(content)
        }
    }
}

impl NameOracle for ChatOracle {
    fn suggest(&self, kind: EntityKind, text: &str) -> Option<String> {
        let prompt = format!(
            "この{}は会計帳簿に記載されたものです。\n業務上の標準表記にしてください：{}",
            kind.label(),
            text
        );
        self.chat(&prompt, 50)
    }

    fn classify_item(&self, text: &str) -> Option<String> {
        let prompt = format!(
            "以下のテキストは帳簿明細の項目です。\n\
             これが『商品名』か『作業項目』か『不明』かを、必ず1語で答えてください。\n\
             テキスト：{text}\n\
             回答形式：商品 または 作業 または 不明"
        );
        self.chat(&prompt, 20)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Scripted oracle for tests: counts calls and replays canned answers.
    pub struct FakeOracle {
        pub suggestions: RefCell<Vec<Option<String>>>,
        pub classifications: RefCell<Vec<Option<String>>>,
        pub suggest_calls: RefCell<usize>,
        pub classify_calls: RefCell<usize>,
    }

    impl FakeOracle {
        pub fn new() -> Self {
            Self {
                suggestions: RefCell::new(Vec::new()),
                classifications: RefCell::new(Vec::new()),
                suggest_calls: RefCell::new(0),
                classify_calls: RefCell::new(0),
            }
        }

        pub fn with_suggestions(answers: Vec<Option<String>>) -> Self {
            let oracle = Self::new();
            *oracle.suggestions.borrow_mut() = answers;
            oracle
        }

        pub fn with_classifications(answers: Vec<Option<String>>) -> Self {
            let oracle = Self::new();
            *oracle.classifications.borrow_mut() = answers;
            oracle
        }
    }

    impl NameOracle for FakeOracle {
        fn suggest(&self, _kind: EntityKind, _text: &str) -> Option<String> {
            *self.suggest_calls.borrow_mut() += 1;
            let mut answers = self.suggestions.borrow_mut();
            if answers.is_empty() {
                None
            } else {
                answers.remove(0)
            }
        }

        fn classify_item(&self, _text: &str) -> Option<String> {
            *self.classify_calls.borrow_mut() += 1;
            let mut answers = self.classifications.borrow_mut();
            if answers.is_empty() {
                None
            } else {
                answers.remove(0)
            }
        }
    }
}
