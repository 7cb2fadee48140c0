//! Document chunking.
//!
//! Chunks target `target_words` whitespace-separated words with
//! `overlap_words` of overlap between neighbors. A chunk prefers to end at
//! a sentence boundary when one is detectable in its tail; otherwise it
//! breaks at the word boundary. Empty content yields zero chunks.

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: u32,
    pub text: String,
    pub word_count: u32,
}

/// Does this word close a sentence? Trailing quotes and brackets after the
/// terminator still count: `end.")` closes.
fn ends_sentence(word: &str) -> bool {
    word.trim_end_matches(['"', '\'', ')', ']', '»', '”', '’'])
        .ends_with(['.', '!', '?'])
}

pub fn chunk_text(text: &str, target_words: u32, overlap_words: u32) -> Vec<Chunk> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    let target = (target_words as usize).max(1);
    let overlap = (overlap_words as usize).min(target.saturating_sub(1));

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let hard_end = (start + target).min(words.len());
        let mut end = hard_end;

        // Pull the cut back to the last sentence end in the tail half of
        // the window, when there is one and more text follows.
        if hard_end < words.len() {
            let floor = start + target / 2;
            for j in (floor..hard_end).rev() {
                if ends_sentence(words[j]) {
                    end = j + 1;
                    break;
                }
            }
        }

        let slice = &words[start..end];
        chunks.push(Chunk {
            index: chunks.len() as u32,
            text: slice.join(" "),
            word_count: slice.len() as u32,
        });

        if end >= words.len() {
            break;
        }
        // Overlap never moves the window backwards past the previous start.
        start = end.saturating_sub(overlap).max(start + 1);
    }
    chunks
}
