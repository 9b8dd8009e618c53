//! Final answer generation from retrieved evidence.
//!
//! One model call, no retry. Everything upstream already degraded as far as
//! it could; if the model call fails the caller hears about it directly
//! rather than paying for the whole pipeline again.

use crate::index::RetrievedChunk;
use ragpipe_core::{Answer, ChatBackend, Error, Result};

pub const DEFAULT_ANSWER_TIMEOUT_MS: u64 = 60_000;

const SYSTEM_PROMPT: &str = "You are a research assistant answering a question from excerpts of web pages.\n\n\
Instructions:\n\
- Answer only from the excerpts provided\n\
- Do not mention excerpts, documents, sources, or how the answer was assembled\n\
- Do not use phrases like \"Based on the provided information\"\n\
- If the excerpts do not contain the answer, say plainly that the retrieved pages do not cover it\n\
- If the excerpts suggest but do not confirm something, express that nuance\n\
- Keep the answer concise and factual\n";

/// Render retrieved chunks into one prompt block, numbered, with their
/// source URLs.
pub fn build_context(chunks: &[RetrievedChunk]) -> String {
    let parts: Vec<String> = chunks
        .iter()
        .enumerate()
        .map(|(i, r)| {
            format!(
                "[Document {}] (source: {})\n{}",
                i + 1,
                r.chunk.source_url,
                r.chunk.text
            )
        })
        .collect();
    parts.join("\n\n---\n\n")
}

fn user_prompt(question: &str, context: &str) -> String {
    format!("User question:\n{question}\n\nRelevant excerpts from web pages:\n{context}")
}

/// Source URLs in retrieval order, first occurrence kept.
pub fn sources_in_order(chunks: &[RetrievedChunk]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for r in chunks {
        if !out.iter().any(|u| u == &r.chunk.source_url) {
            out.push(r.chunk.source_url.clone());
        }
    }
    out
}

/// Pick a chat backend from the environment.
///
/// `RAGPIPE_LLM_PROVIDER` forces `openai_compat` or `ollama`; the default
/// (`auto`) prefers an OpenAI-compatible endpoint when one is configured,
/// then an enabled local Ollama.
pub fn chat_backend_from_env(client: reqwest::Client) -> Result<Box<dyn ChatBackend>> {
    use crate::ollama::OllamaChat;
    use crate::openai_compat::OpenAiCompatChat;

    let forced = std::env::var("RAGPIPE_LLM_PROVIDER")
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match forced.as_str() {
        "openai_compat" => return Ok(Box::new(OpenAiCompatChat::from_env(client)?)),
        "ollama" => return Ok(Box::new(OllamaChat::from_env(client)?)),
        "" | "auto" => {}
        other => {
            return Err(Error::NotConfigured(format!(
                "unknown RAGPIPE_LLM_PROVIDER: {other}"
            )))
        }
    }
    if let Ok(chat) = OpenAiCompatChat::from_env(client.clone()) {
        return Ok(Box::new(chat));
    }
    if let Ok(chat) = OllamaChat::from_env(client) {
        return Ok(Box::new(chat));
    }
    Err(Error::NotConfigured(
        "no chat backend configured; set RAGPIPE_OPENAI_COMPAT_BASE_URL or RAGPIPE_OLLAMA_ENABLE"
            .to_string(),
    ))
}

pub async fn generate_answer(
    chat: &dyn ChatBackend,
    question: &str,
    chunks: &[RetrievedChunk],
    timeout_ms: u64,
) -> Result<Answer> {
    if chunks.is_empty() {
        return Err(Error::NoEvidence {
            stage: "retrieve",
            detail: "no chunks were retrieved".to_string(),
        });
    }

    let context = build_context(chunks);
    let user = user_prompt(question, &context);
    tracing::debug!(
        backend = chat.name(),
        chunks = chunks.len(),
        context_chars = context.len(),
        "generating answer"
    );

    let raw = chat.chat(SYSTEM_PROMPT, &user, timeout_ms).await?;
    let text = raw.trim().to_string();
    if text.is_empty() {
        return Err(Error::Llm("model returned an empty answer".to_string()));
    }

    Ok(Answer {
        text,
        sources: sources_in_order(chunks),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragpipe_core::Chunk;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn retrieved(text: &str, url: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk {
                text: text.to_string(),
                source_url: url.to_string(),
                position: 0,
            },
            relevance: 0.5,
        }
    }

    struct FixtureChat {
        script: Mutex<Vec<Result<String>>>,
        calls: AtomicUsize,
        captured: Mutex<Vec<(String, String)>>,
    }

    impl FixtureChat {
        fn replying(script: Vec<Result<String>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                captured: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ChatBackend for FixtureChat {
        fn name(&self) -> &'static str {
            "fixture"
        }

        async fn chat(&self, system: &str, user: &str, _timeout_ms: u64) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.captured
                .lock()
                .unwrap()
                .push((system.to_string(), user.to_string()));
            self.script.lock().unwrap().remove(0)
        }
    }

    #[test]
    fn context_numbers_chunks_and_names_sources() {
        let chunks = vec![
            retrieved("first fact", "https://cdc.gov/a"),
            retrieved("second fact", "https://who.int/b"),
        ];
        let ctx = build_context(&chunks);
        assert!(ctx.starts_with("[Document 1] (source: https://cdc.gov/a)\nfirst fact"));
        assert!(ctx.contains("\n\n---\n\n[Document 2] (source: https://who.int/b)\nsecond fact"));
    }

    #[test]
    fn sources_deduplicate_in_retrieval_order() {
        let chunks = vec![
            retrieved("a", "https://who.int/b"),
            retrieved("b", "https://cdc.gov/a"),
            retrieved("c", "https://who.int/b"),
        ];
        assert_eq!(
            sources_in_order(&chunks),
            vec!["https://who.int/b", "https://cdc.gov/a"]
        );
    }

    #[tokio::test]
    async fn answer_carries_trimmed_text_and_sources() {
        let chat = FixtureChat::replying(vec![Ok("  Vaccinate promptly.  \n".to_string())]);
        let chunks = vec![retrieved("vaccination guidance", "https://cdc.gov/rabies")];

        let answer = generate_answer(&chat, "How to prevent rabies?", &chunks, 1_000)
            .await
            .unwrap();
        assert_eq!(answer.text, "Vaccinate promptly.");
        assert_eq!(answer.sources, vec!["https://cdc.gov/rabies"]);

        let captured = chat.captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].1.contains("How to prevent rabies?"));
        assert!(captured[0].1.contains("vaccination guidance"));
    }

    #[tokio::test]
    async fn no_chunks_is_a_no_evidence_error() {
        let chat = FixtureChat::replying(vec![]);
        let err = generate_answer(&chat, "q", &[], 1_000).await.unwrap_err();
        match err {
            Error::NoEvidence { stage, .. } => assert_eq!(stage, "retrieve"),
            other => panic!("expected NoEvidence, got {other}"),
        }
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn model_failure_is_terminal_without_retry() {
        let chat = FixtureChat::replying(vec![Err(Error::Llm("provider down".to_string()))]);
        let chunks = vec![retrieved("x", "https://cdc.gov/a")];

        let err = generate_answer(&chat, "q", &chunks, 1_000).await.unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_model_output_is_an_error() {
        let chat = FixtureChat::replying(vec![Ok("   \n".to_string())]);
        let chunks = vec![retrieved("x", "https://cdc.gov/a")];
        let err = generate_answer(&chat, "q", &chunks, 1_000).await.unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
    }

    #[test]
    fn unknown_llm_provider_is_rejected() {
        let prev = std::env::var("RAGPIPE_LLM_PROVIDER").ok();
        std::env::set_var("RAGPIPE_LLM_PROVIDER", "frobnicate");
        let err = chat_backend_from_env(reqwest::Client::new()).err().unwrap();
        match prev {
            Some(v) => std::env::set_var("RAGPIPE_LLM_PROVIDER", v),
            None => std::env::remove_var("RAGPIPE_LLM_PROVIDER"),
        }
        assert!(matches!(err, Error::NotConfigured(_)));
    }
}
