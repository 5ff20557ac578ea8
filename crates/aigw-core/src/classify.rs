//! Endpoint classification and downstream auth extraction.

use http::{HeaderMap, Method};

use aigw_protocol::Dialect;

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    OpenAIChat,
    OpenAIResponses,
    ClaudeMessages,
    GeminiGenerate { model: String, stream: bool },
    OpenAIModelList,
    GeminiModelList,
}

impl Endpoint {
    pub fn dialect(&self) -> Dialect {
        match self {
            Endpoint::OpenAIChat | Endpoint::OpenAIModelList => Dialect::OpenAI,
            Endpoint::OpenAIResponses => Dialect::OpenAIResponses,
            Endpoint::ClaudeMessages => Dialect::Claude,
            Endpoint::GeminiGenerate { .. } | Endpoint::GeminiModelList => Dialect::Gemini,
        }
    }

    pub fn is_model_list(&self) -> bool {
        matches!(self, Endpoint::OpenAIModelList | Endpoint::GeminiModelList)
    }
}

pub fn classify_request(method: &Method, path: &str) -> Result<Endpoint, GatewayError> {
    let path = path.trim_start_matches('/');
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["v1", "chat", "completions"] => {
            ensure_post(method, "chat completions")?;
            Ok(Endpoint::OpenAIChat)
        }
        ["v1", "responses"] => {
            ensure_post(method, "responses")?;
            Ok(Endpoint::OpenAIResponses)
        }
        ["v1", "messages"] => {
            ensure_post(method, "messages")?;
            Ok(Endpoint::ClaudeMessages)
        }
        ["v1", "models"] => {
            ensure_get(method, "models list")?;
            Ok(Endpoint::OpenAIModelList)
        }
        ["v1beta", "models"] => {
            ensure_get(method, "models list")?;
            Ok(Endpoint::GeminiModelList)
        }
        ["v1beta", "models", rest @ ..] => {
            ensure_post(method, "gemini generate")?;
            let joined = rest.join("/");
            let (model, action) = match joined.split_once(':') {
                Some((model, action)) => (model.to_string(), action),
                None => {
                    return Err(GatewayError::bad_request("missing gemini action"));
                }
            };
            let stream = match action {
                "generateContent" => false,
                "streamGenerateContent" => true,
                other => {
                    return Err(GatewayError::bad_request(format!(
                        "unknown gemini action {other}"
                    )));
                }
            };
            Ok(Endpoint::GeminiGenerate { model, stream })
        }
        _ => Err(GatewayError::bad_request(format!("unknown endpoint /{path}"))),
    }
}

/// Downstream key, in any of the accepted positions.
pub fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_string());
    }
    for header in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(header).and_then(|value| value.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    let query = query.unwrap_or("");
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("key=") {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn ensure_post(method: &Method, label: &str) -> Result<(), GatewayError> {
    if method == Method::POST {
        Ok(())
    } else {
        Err(GatewayError::bad_request(format!(
            "invalid method for {label}"
        )))
    }
}

fn ensure_get(method: &Method, label: &str) -> Result<(), GatewayError> {
    if method == Method::GET {
        Ok(())
    } else {
        Err(GatewayError::bad_request(format!(
            "invalid method for {label}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_six_endpoints_classify() {
        assert_eq!(
            classify_request(&Method::POST, "/v1/chat/completions").unwrap(),
            Endpoint::OpenAIChat
        );
        assert_eq!(
            classify_request(&Method::POST, "/v1/responses").unwrap(),
            Endpoint::OpenAIResponses
        );
        assert_eq!(
            classify_request(&Method::POST, "/v1/messages").unwrap(),
            Endpoint::ClaudeMessages
        );
        assert_eq!(
            classify_request(&Method::GET, "/v1/models").unwrap(),
            Endpoint::OpenAIModelList
        );
        assert_eq!(
            classify_request(&Method::GET, "/v1beta/models").unwrap(),
            Endpoint::GeminiModelList
        );
        assert_eq!(
            classify_request(
                &Method::POST,
                "/v1beta/models/gemini-2.5-pro:streamGenerateContent"
            )
            .unwrap(),
            Endpoint::GeminiGenerate {
                model: "gemini-2.5-pro".to_string(),
                stream: true
            }
        );
    }

    #[test]
    fn wrong_method_is_a_bad_request() {
        let err = classify_request(&Method::GET, "/v1/messages").unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn api_key_positions_all_work() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            "Bearer secret-1".parse().unwrap(),
        );
        assert_eq!(extract_api_key(&headers, None).as_deref(), Some("secret-1"));

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "secret-2".parse().unwrap());
        assert_eq!(extract_api_key(&headers, None).as_deref(), Some("secret-2"));

        let headers = HeaderMap::new();
        assert_eq!(
            extract_api_key(&headers, Some("alt=sse&key=secret-3")).as_deref(),
            Some("secret-3")
        );
        assert_eq!(extract_api_key(&headers, Some("alt=sse")), None);
    }
}
