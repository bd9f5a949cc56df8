//! Provider-specific configuration and detection.
//!
//! This module handles differences between completion-API providers:
//! URL patterns and request attribution headers.

/// Supported completion-API providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// `OpenAI` (api.openai.com)
    OpenAI,
    /// `OpenRouter` (openrouter.ai)
    OpenRouter,
    /// Generic OpenAI-compatible provider
    Generic,
}

impl Provider {
    /// Detect provider from base URL.
    #[must_use]
    pub fn detect_from_url(base_url: &str) -> Self {
        let lower = base_url.to_lowercase();

        if lower.contains("openrouter.ai") {
            Self::OpenRouter
        } else if lower.contains("openai.com") {
            Self::OpenAI
        } else {
            Self::Generic
        }
    }

    /// Build the chat completions URL for this provider.
    #[must_use]
    pub fn build_chat_url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        format!("{base}/v1/chat/completions")
    }

    /// Attribution headers some providers document for ranking/abuse
    /// purposes. `OpenRouter` wants `HTTP-Referer` and `X-Title`.
    #[must_use]
    pub fn attribution_headers(&self) -> Vec<(&'static str, &'static str)> {
        match self {
            Self::OpenRouter => vec![
                ("HTTP-Referer", "http://localhost:8081"),
                ("X-Title", env!("CARGO_PKG_NAME")),
            ],
            Self::OpenAI | Self::Generic => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_openai() {
        let provider = Provider::detect_from_url("https://api.openai.com");
        assert_eq!(provider, Provider::OpenAI);
    }

    #[test]
    fn test_detect_openrouter() {
        let provider = Provider::detect_from_url("https://openrouter.ai/api");
        assert_eq!(provider, Provider::OpenRouter);
    }

    #[test]
    fn test_detect_generic() {
        let provider = Provider::detect_from_url("http://127.0.0.1:11434");
        assert_eq!(provider, Provider::Generic);
    }

    #[test]
    fn test_build_url_strips_trailing_slash() {
        let url = Provider::OpenRouter.build_chat_url("https://openrouter.ai/api/");
        assert_eq!(url, "https://openrouter.ai/api/v1/chat/completions");
    }

    #[test]
    fn test_openrouter_attribution() {
        let headers = Provider::OpenRouter.attribution_headers();
        assert!(headers.iter().any(|(k, _)| *k == "HTTP-Referer"));
        assert!(Provider::Generic.attribution_headers().is_empty());
    }
}
