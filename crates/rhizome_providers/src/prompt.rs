//! Extraction prompt construction.

use crate::extractor::KnownConcept;

pub const EXTRACTION_SYSTEM_PROMPT: &str = "\
You extract a knowledge graph from text. Respond with a single JSON object \
with exactly these top-level keys: \"concepts\", \"instances\", \"relationships\".\n\
- concepts: [{\"concept_id\": kebab-case string, \"label\": string, \
\"confidence\": number in [0,1], \"search_terms\": [string]}]\n\
- instances: [{\"concept_id\": string, \"quote\": verbatim substring of the text}]\n\
- relationships: [{\"from_concept_id\": string, \"to_concept_id\": string, \
\"type\": one of IMPLIES|SUPPORTS|CONTRADICTS|PART_OF|REQUIRES or another \
UPPER_SNAKE term, \"confidence\": number in [0,1]}]\n\
Reuse ids from the known-concepts list when the text refers to the same idea. \
Every concept_id referenced by an instance or relationship must appear in \
\"concepts\". Quotes must be copied exactly from the text.";

const STRICT_REMINDER: &str = "\
REMINDER: the previous response did not parse. Output ONLY the JSON object, \
no prose, no code fences. All three keys are mandatory even when empty. \
Quotes must be exact substrings of the provided text.";

/// Build the user message for one chunk.
pub fn build_user_prompt(chunk_text: &str, context: &[KnownConcept], strict: bool) -> String {
    let mut prompt = String::with_capacity(chunk_text.len() + 1024);

    if !context.is_empty() {
        prompt.push_str("Known concepts (reuse these ids where applicable):\n");
        for concept in context {
            prompt.push_str(&format!(
                "- {} ({}): {}\n",
                concept.id,
                concept.label,
                concept.search_terms.join(", ")
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str("Text:\n---\n");
    prompt.push_str(chunk_text);
    prompt.push_str("\n---\n");

    if strict {
        prompt.push('\n');
        prompt.push_str(STRICT_REMINDER);
    }

    prompt
}
