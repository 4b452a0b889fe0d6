//! Endpoint flavours for the completion and embedding clients.
//!
//! Only Azure differs from the plain `/v1/...` layout: it routes by
//! deployment, versions by query string and takes the key in `api-key`.

const DEFAULT_AZURE_API_VERSION: &str = "2024-08-01-preview";

/// How to address and authenticate against an LLM endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// Anything serving the `OpenAI` REST layout under `/v1`.
    OpenAiCompatible,
    /// Azure `OpenAI` Service.
    AzureOpenAI {
        deployment_name: String,
        api_version: String,
    },
}

impl Provider {
    /// Guess the flavour from the base URL. Azure deployments still need a name.
    #[must_use]
    pub fn detect_from_url(base_url: &str) -> Self {
        if base_url.to_lowercase().contains(".azure.com") {
            Self::azure("")
        } else {
            Self::OpenAiCompatible
        }
    }

    pub fn azure(deployment_name: impl Into<String>) -> Self {
        Self::AzureOpenAI {
            deployment_name: deployment_name.into(),
            api_version: DEFAULT_AZURE_API_VERSION.to_string(),
        }
    }

    #[must_use]
    pub fn build_chat_url(&self, base_url: &str) -> String {
        self.endpoint(base_url, "chat/completions")
    }

    #[must_use]
    pub fn build_embeddings_url(&self, base_url: &str) -> String {
        self.endpoint(base_url, "embeddings")
    }

    fn endpoint(&self, base_url: &str, path: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            Self::OpenAiCompatible => format!("{base}/v1/{path}"),
            Self::AzureOpenAI {
                deployment_name,
                api_version,
            } => format!(
                "{base}/openai/deployments/{deployment_name}/{path}?api-version={api_version}"
            ),
        }
    }

    /// Attach the API key, if any, in the header this flavour expects.
    pub fn authorize(
        &self,
        rb: reqwest::RequestBuilder,
        api_key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match (self, api_key) {
            (_, None) => rb,
            (Self::AzureOpenAI { .. }, Some(key)) => rb.header("api-key", key),
            (Self::OpenAiCompatible, Some(key)) => rb.bearer_auth(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection() {
        assert_eq!(
            Provider::detect_from_url("https://api.openai.com"),
            Provider::OpenAiCompatible
        );
        assert_eq!(
            Provider::detect_from_url("http://localhost:11434"),
            Provider::OpenAiCompatible
        );
        assert!(matches!(
            Provider::detect_from_url("https://acme.openai.azure.com"),
            Provider::AzureOpenAI { .. }
        ));
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            Provider::OpenAiCompatible.build_chat_url("https://api.openai.com/"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            Provider::azure("embed-small").build_embeddings_url("https://acme.openai.azure.com"),
            "https://acme.openai.azure.com/openai/deployments/embed-small/embeddings?api-version=2024-08-01-preview"
        );
    }
}
