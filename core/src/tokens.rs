//! Token estimation for the context budget.
//!
//! The default path is a cheap heuristic (`chars/4 + 4` per message, with a
//! CJK-aware weighting for scripts that tokenize denser). A precise BPE
//! counter backed by `tiktoken-rs` is available behind the same trait;
//! callers are injected with one or the other at construction time and must
//! tolerate the heuristic's imprecision.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::models::Message;

/// Fixed per-message overhead (role framing, separators).
const MESSAGE_OVERHEAD: usize = 4;
/// Fixed per-tool-call overhead (id, type, function framing).
const TOOL_CALL_OVERHEAD: usize = 8;

pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    fn count_message(&self, msg: &Message) -> usize {
        let mut total = MESSAGE_OVERHEAD + self.count_text(&msg.content);
        if let Some(reasoning) = &msg.reasoning {
            total += self.count_text(reasoning);
        }
        for call in &msg.tool_calls {
            total += TOOL_CALL_OVERHEAD
                + self.count_text(&call.function.name)
                + self.count_text(&call.function.arguments);
        }
        total
    }

    fn count_messages(&self, msgs: &[Message]) -> usize {
        msgs.iter().map(|m| self.count_message(m)).sum()
    }
}

/// `chars/4 + 4` with CJK weighting: a string dominated by CJK codepoints
/// estimates at `cjk*1.5 + ascii*0.25` instead, since those scripts sit
/// close to one token per character.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count_text(&self, text: &str) -> usize {
        let mut total = 0usize;
        let mut cjk = 0usize;
        for c in text.chars() {
            total += 1;
            if is_cjk(c) {
                cjk += 1;
            }
        }
        if cjk * 2 > total {
            let other = total - cjk;
            (cjk as f64 * 1.5 + other as f64 * 0.25).ceil() as usize
        } else {
            total / 4
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF          // CJK Unified Ideographs
        | 0x3400..=0x4DBF        // Extension A
        | 0x3040..=0x30FF        // Hiragana + Katakana
        | 0xAC00..=0xD7AF        // Hangul syllables
        | 0xF900..=0xFAFF        // Compatibility ideographs
    )
}

/// Precise counter over a BPE vocabulary.
pub struct BpeCounter {
    bpe: CoreBPE,
}

impl BpeCounter {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }
}

impl TokenCounter for BpeCounter {
    fn count_text(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

/// The BPE counter when its vocabulary loads, else the heuristic.
pub fn default_counter() -> Arc<dyn TokenCounter> {
    match BpeCounter::new() {
        Ok(counter) => Arc::new(counter),
        Err(e) => {
            tracing::warn!("BPE tokenizer unavailable, using heuristic estimate: {e:#}");
            Arc::new(HeuristicCounter)
        }
    }
}
