//! `@name` mention extraction from agent replies.
//!
//! A mention's message is the text between it and the next mention (or the
//! end of the reply). Email addresses like `ops@example.com` are not matched:
//! a word character, `.` or `-` right before `@` disqualifies it.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use chorus_core::config::VocabularyMode;

static MENTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([a-zA-Z][a-zA-Z0-9_-]*)").unwrap());

/// One routing request found in a reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mention {
    /// Lowercase agent name.
    pub target: String,
    pub message: String,
}

pub struct MentionExtractor {
    known: HashSet<String>,
    mode: VocabularyMode,
}

struct Token {
    start: usize,
    end: usize,
    name: String,
}

impl MentionExtractor {
    pub fn new(mode: VocabularyMode, names: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self {
            known: names.into_iter().map(|n| n.as_ref().to_lowercase()).collect(),
            mode,
        }
    }

    /// Only names in `names` are mentions.
    pub fn closed(names: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self::new(VocabularyMode::Closed, names)
    }

    /// Every syntactically valid `@token` is a mention.
    pub fn open(names: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self::new(VocabularyMode::Open, names)
    }

    /// Extract mentions in first-occurrence order, one per target.
    ///
    /// Targets in `exclude` are dropped but still end the preceding fragment.
    /// A repeated target's fragment is appended to its first message.
    pub fn extract(&self, text: &str, exclude: &HashSet<String>) -> Vec<Mention> {
        let tokens = self.tokens(text);

        let mut mentions: Vec<Mention> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();

        for (i, token) in tokens.iter().enumerate() {
            if exclude.contains(&token.name) {
                continue;
            }
            let stop = tokens.get(i + 1).map_or(text.len(), |next| next.start);
            let fragment = text[token.end..stop].trim();

            match seen.get(&token.name) {
                Some(&pos) => {
                    if !fragment.is_empty() {
                        let message = &mut mentions[pos].message;
                        if !message.is_empty() {
                            message.push('\n');
                        }
                        message.push_str(fragment);
                    }
                }
                None => {
                    seen.insert(token.name.clone(), mentions.len());
                    mentions.push(Mention {
                        target: token.name.clone(),
                        message: fragment.to_string(),
                    });
                }
            }
        }

        // A bare mention still hands the target the whole context.
        for mention in &mut mentions {
            if mention.message.is_empty() {
                mention.message = text.trim().to_string();
            }
        }

        mentions
    }

    fn tokens(&self, text: &str) -> Vec<Token> {
        MENTION_PATTERN
            .captures_iter(text)
            .filter_map(|cap| {
                let whole = cap.get(0)?;
                let name = cap.get(1)?.as_str().to_lowercase();
                let preceded_by_word = text[..whole.start()]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'));
                if preceded_by_word {
                    return None;
                }
                if self.mode == VocabularyMode::Closed && !self.known.contains(&name) {
                    return None;
                }
                Some(Token {
                    start: whole.start(),
                    end: whole.end(),
                    name,
                })
            })
            .collect()
    }
}
