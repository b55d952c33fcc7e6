//! Streaming sentence segmentation and TTS text cleanup.
//!
//! The turn loop feeds accumulated LLM deltas through a
//! [`SentenceSplitter`], which cuts a segment whenever the unsent
//! suffix gains a new terminal-punctuation boundary. Segments go to
//! the synthesizer after [`clean_for_tts`] strips everything that
//! should not be spoken aloud.

use std::sync::OnceLock;

use regex::Regex;

/// Hard cap applied before synthesis.
pub const MAX_TTS_CHARS: usize = 255;

/// Punctuation that ends a speakable sentence.
const TERMINALS: &[char] = &[
    '.', '!', '?', ';', '。', '！', '？', '；', '…',
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cleaning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn stage_direction_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Bracketed stage directions: (smiles), [sighs], 【旁白】, （笑）.
        Regex::new(r"\([^)]*\)|\[[^\]]*\]|【[^】]*】|（[^）]*）").unwrap()
    })
}

fn markdown_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap())
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF   // pictographs, symbols, supplemental
        | 0x2600..=0x27BF   // misc symbols + dingbats
        | 0x2B00..=0x2BFF   // misc symbols and arrows
        | 0xFE00..=0xFE0F   // variation selectors
        | 0x200D            // zero-width joiner
    )
}

/// Strip everything that should not reach the synthesizer: emoji,
/// markdown markup, and bracketed stage directions. Whitespace is
/// collapsed; the result may be empty, in which case no audio is
/// produced for the segment.
pub fn clean_for_tts(text: &str) -> String {
    let text = markdown_link_re().replace_all(text, "$1");
    let text = stage_direction_re().replace_all(&text, "");

    let mut cleaned = String::with_capacity(text.len());
    for c in text.chars() {
        if is_emoji(c) {
            continue;
        }
        if matches!(c, '*' | '#' | '`' | '>' | '|') {
            continue;
        }
        cleaned.push(c);
    }

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cap a cleaned segment at [`MAX_TTS_CHARS`] characters.
pub fn truncate_for_tts(text: &str) -> String {
    if text.chars().count() <= MAX_TTS_CHARS {
        return text.to_string();
    }
    text.chars().take(MAX_TTS_CHARS).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Splitting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Byte offset just past the last terminal punctuation, if any.
fn last_boundary(text: &str) -> Option<usize> {
    let mut cut = None;
    for (idx, c) in text.char_indices() {
        if TERMINALS.contains(&c) {
            cut = Some(idx + c.len_utf8());
        }
    }
    cut
}

/// Accumulates streamed text and cuts at sentence boundaries.
#[derive(Default)]
pub struct SentenceSplitter {
    pending: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta. When the pending text now contains a terminal
    /// boundary, everything up to the last boundary is cut and
    /// returned as one segment.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.pending.push_str(delta);
        let cut = last_boundary(&self.pending)?;
        let segment: String = self.pending.drain(..cut).collect();
        let segment = segment.trim().to_string();
        if segment.is_empty() {
            None
        } else {
            Some(segment)
        }
    }

    /// Flush the unterminated tail at stream end.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.pending);
        let tail = tail.trim().to_string();
        if tail.is_empty() {
            None
        } else {
            Some(tail)
        }
    }

    /// Drop any pending text (tool-call markup is never spoken).
    pub fn discard(&mut self) {
        self.pending.clear();
    }
}
