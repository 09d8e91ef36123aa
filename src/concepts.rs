use tracing::info;

use crate::chat::types::ChatMessage;
use crate::chat::{ChatError, ChatService};

const EXTRACTION_TEMPERATURE: f32 = 0.2;

const OPEN_TAG: &str = "<search_terms>";
const CLOSE_TAG: &str = "</search_terms>";

const FEW_SHOT_EXAMPLES: &str = r#"<examples>
<example>
<query>
What are the findings of acute pancreatitis on contrast-enhanced CT?
</query>
<ideal_output>
<analysis>
Main radiological concept: acute pancreatitis. The query does not ask for a comparison, so a single concise term suffices. Searching for "acute pancreatitis" will cover the imaging findings the query asks about.
</analysis>
<search_terms>acute pancreatitis</search_terms>
</ideal_output>
</example>
<example>
<query>
How to differentiate primary CNS lymphoma from glioblastoma on MRI?
</query>
<ideal_output>
<analysis>
Main radiological concepts: primary CNS lymphoma, glioblastoma. The query explicitly asks for a comparison between two named conditions, so both terms are searched.
</analysis>
<search_terms>CNS lymphoma
glioblastoma</search_terms>
</ideal_output>
</example>
<example>
<query>
How does a TOF MRA work?
</query>
<ideal_output>
<analysis>
Main radiological concept: TOF MRA. A single imaging technique is asked about; searching for "TOF MRA" will cover its working principle.
</analysis>
<search_terms>TOF MRA</search_terms>
</ideal_output>
</example>
</examples>"#;

const INSTRUCTIONS: &str = r#"You are an experienced radiologist generating search terms for a radiology encyclopedia from user queries. Identify the core concept, condition, or imaging technique mentioned in the query and provide concise, targeted search terms.

Guidelines:
1. Search terms are concise noun phrases or technical terms, not full questions.
2. Provide one search term in general; provide two only when the query explicitly asks for a comparison between two named conditions.
3. Focus on the underlying medical concept, even when the query is about one specific aspect of it.

Wrap your reasoning in <analysis> tags, then provide the term(s), one per line, wrapped in <search_terms> tags."#;

/// Pull search terms out of a model reply: first well-formed
/// `<search_terms>` block, one term per line, trimmed, blanks dropped.
/// Tag names are case-sensitive. No parseable block means no terms, not an
/// error.
pub fn parse_search_terms(text: &str) -> Vec<String> {
    let Some(open) = text.find(OPEN_TAG) else {
        return Vec::new();
    };
    let body_start = open + OPEN_TAG.len();
    let Some(len) = text[body_start..].find(CLOSE_TAG) else {
        return Vec::new();
    };

    text[body_start..body_start + len]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// One low-randomness completion turning a free-text question into an
/// ordered list of search concepts. The `<analysis>` prefill steers the
/// model straight into the expected output shape.
pub async fn extract_concepts(
    chat: &impl ChatService,
    query: &str,
) -> Result<Vec<String>, ChatError> {
    let messages = [
        ChatMessage::user(format!(
            "{FEW_SHOT_EXAMPLES}\n\n{INSTRUCTIONS}\n\n<query>{query}</query>"
        )),
        ChatMessage::assistant("<analysis>"),
    ];

    let reply = chat.complete(&messages, EXTRACTION_TEMPERATURE).await?;
    let terms = parse_search_terms(&reply);
    info!(query, terms = ?terms, "extracted search terms");
    Ok(terms)
}
