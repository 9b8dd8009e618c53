use serde::Serialize;

pub(crate) fn warning_hint(code: &'static str) -> Option<&'static str> {
    match code {
        "search_degraded_empty" => Some(
            "One or more site-restricted searches failed after retries and contributed no URLs. Check the provider configuration (RAGPIPE_SERPER_API_KEY / RAGPIPE_SEARXNG_ENDPOINT) or retry later.",
        ),
        "no_results" => Some(
            "No planned query returned any URL. Loosen the domain list, rephrase the question, or check that the configured provider can reach the network.",
        ),
        "tool_unavailable" => Some(
            "The MCP child process could not be started or did not expose a usable search tool, so the whole run used the in-process provider. Check that this binary was built with the stdio feature.",
        ),
        "tool_fallback_used" => Some(
            "The MCP search tool failed or returned nothing for some queries; those queries were re-run against the in-process provider.",
        ),
        "deadline_partial_results" => Some(
            "The overall deadline elapsed mid-run; the result was produced from the URLs and documents gathered before the cutoff. Increase --overall-timeout-ms for fuller coverage.",
        ),
        "empty_extraction" => Some(
            "Some fetched pages produced no extractable text and were dropped (see ingest.failures for per-URL reasons).",
        ),
        _ => None,
    }
}

pub(crate) fn warning_hints_from(codes: &[&'static str]) -> serde_json::Value {
    let mut m = serde_json::Map::new();
    for c in codes {
        if let Some(h) = warning_hint(c) {
            m.insert((*c).to_string(), serde_json::json!(h));
        }
    }
    serde_json::Value::Object(m)
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum ErrorCode {
    InvalidParams,
    NotConfigured,
    SearchFailed,
    FetchFailed,
    ToolUnavailable,
    NoEvidence,
    EmbedFailed,
    LlmFailed,
}

impl ErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "invalid_params",
            Self::NotConfigured => "not_configured",
            Self::SearchFailed => "search_failed",
            Self::FetchFailed => "fetch_failed",
            Self::ToolUnavailable => "tool_unavailable",
            Self::NoEvidence => "no_evidence",
            Self::EmbedFailed => "embed_failed",
            Self::LlmFailed => "llm_failed",
        }
    }

    pub(crate) fn retryable(self) -> bool {
        match self {
            // Provider-side failures may clear up on their own.
            Self::SearchFailed | Self::FetchFailed | Self::EmbedFailed | Self::LlmFailed => true,
            // Configuration + invalid input are not retryable without changing something.
            Self::InvalidParams
            | Self::NotConfigured
            | Self::ToolUnavailable
            | Self::NoEvidence => false,
        }
    }
}

/// Map a pipeline error onto the stable envelope code space.
pub(crate) fn code_for(e: &ragpipe_core::Error) -> ErrorCode {
    use ragpipe_core::Error as E;
    match e {
        E::InvalidUrl(_) | E::NotSupported(_) => ErrorCode::InvalidParams,
        E::NotConfigured(_) => ErrorCode::NotConfigured,
        E::Search(_) => ErrorCode::SearchFailed,
        E::Fetch(_) => ErrorCode::FetchFailed,
        E::Tool(_) => ErrorCode::ToolUnavailable,
        E::NoEvidence { .. } => ErrorCode::NoEvidence,
        E::Embed(_) => ErrorCode::EmbedFailed,
        E::Llm(_) => ErrorCode::LlmFailed,
    }
}

pub(crate) fn hint_for(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::InvalidParams => "Check the request arguments.",
        ErrorCode::NotConfigured => {
            "Set RAGPIPE_SERPER_API_KEY or RAGPIPE_SEARXNG_ENDPOINT for search, and an LLM backend (RAGPIPE_OPENAI_COMPAT_BASE_URL or RAGPIPE_OLLAMA_ENABLE) for answering."
        }
        ErrorCode::SearchFailed => "The search provider failed after retries. Retry later.",
        ErrorCode::FetchFailed => "Page fetching failed. Retry later or adjust timeouts.",
        ErrorCode::ToolUnavailable => {
            "The MCP search tool could not be used. Run with --direct to stay in-process."
        }
        ErrorCode::NoEvidence => {
            "No usable evidence was gathered for this question. Loosen the domain list or rephrase the question."
        }
        ErrorCode::EmbedFailed => {
            "The embeddings backend failed. Check RAGPIPE_OLLAMA_EMBED settings or unset it to use the hashed embedder."
        }
        ErrorCode::LlmFailed => "The answering model failed. Check the LLM backend and retry.",
    }
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(super::SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
    // Keep a small set of ubiquitous envelope keys stable:
    // - attempts: null or object (clients avoid "missing vs present" branching)
    // - request: null or object
    if payload.get("attempts").is_none() {
        payload["attempts"] = serde_json::Value::Null;
    }
    if payload.get("request").is_none() {
        payload["request"] = serde_json::Value::Null;
    }
}

pub(crate) fn error_obj(
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: String,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: hint.to_string(),
        retryable: code.retryable(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": hint.to_string(),
            "retryable": code.retryable()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_exhaustion_surfaces_as_no_evidence() {
        // Zero loaded documents is a terminal evidence gap, not an
        // internal failure.
        let e = ragpipe_core::Error::NoEvidence {
            stage: "ingest",
            detail: "0 of 4 documents loaded".to_string(),
        };
        let code = code_for(&e);
        assert_eq!(code.as_str(), "no_evidence");
        assert!(!code.retryable());

        let obj = error_obj(code, e.to_string(), hint_for(code));
        assert_eq!(obj["code"].as_str(), Some("no_evidence"));
        assert_eq!(obj["retryable"].as_bool(), Some(false));
        assert!(obj["message"]
            .as_str()
            .unwrap_or("")
            .contains("no evidence at ingest"));
    }
}
