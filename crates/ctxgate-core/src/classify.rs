use ctxgate_provider::ProviderId;

/// What an inference path resolved to. The provider adapter is chosen by
/// request path; Bedrock has no inbound route of its own (clients speak the
/// three CLI wire shapes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedRoute {
    pub provider: ProviderId,
    /// Model from the URL path (Gemini); body-carried otherwise.
    pub path_model: Option<String>,
    /// Streaming requested via the path or query (Gemini); body-carried
    /// otherwise.
    pub path_stream: bool,
}

/// Maps an inference request path to its provider. Returns None for paths
/// the gateway does not front.
pub fn classify_inference(path: &str, query: Option<&str>) -> Option<ClassifiedRoute> {
    let path = path.trim_start_matches('/');
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["v1", "messages"] => Some(ClassifiedRoute {
            provider: ProviderId::Anthropic,
            path_model: None,
            path_stream: false,
        }),
        ["v1", "chat", "completions"] => Some(ClassifiedRoute {
            provider: ProviderId::OpenAi,
            path_model: None,
            path_stream: false,
        }),
        ["v1beta", "models", rest @ ..] if !rest.is_empty() => {
            let joined = rest.join("/");
            let (model, action) = match joined.split_once(':') {
                Some((model, action)) => (model.to_string(), action),
                None => return None,
            };
            let sse_query = query
                .map(|q| q.contains("alt=sse"))
                .unwrap_or(false);
            match action {
                "generateContent" => Some(ClassifiedRoute {
                    provider: ProviderId::Gemini,
                    path_model: Some(model),
                    path_stream: sse_query,
                }),
                "streamGenerateContent" => Some(ClassifiedRoute {
                    provider: ProviderId::Gemini,
                    path_model: Some(model),
                    path_stream: true,
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_route() {
        let route = classify_inference("/v1/messages", None).unwrap();
        assert_eq!(route.provider, ProviderId::Anthropic);
        assert!(!route.path_stream);
    }

    #[test]
    fn openai_route() {
        let route = classify_inference("/v1/chat/completions", None).unwrap();
        assert_eq!(route.provider, ProviderId::OpenAi);
    }

    #[test]
    fn gemini_stream_route_carries_model() {
        let route =
            classify_inference("/v1beta/models/gemini-2.5-pro:streamGenerateContent", None)
                .unwrap();
        assert_eq!(route.provider, ProviderId::Gemini);
        assert_eq!(route.path_model.as_deref(), Some("gemini-2.5-pro"));
        assert!(route.path_stream);
    }

    #[test]
    fn gemini_generate_with_sse_query_streams() {
        let route = classify_inference(
            "/v1beta/models/gemini-2.5-flash:generateContent",
            Some("alt=sse"),
        )
        .unwrap();
        assert!(route.path_stream);
    }

    #[test]
    fn unknown_paths_are_rejected() {
        assert!(classify_inference("/v1/embeddings", None).is_none());
        assert!(classify_inference("/v1beta/models/gemini-2.5-pro", None).is_none());
    }
}
