//! Gemini `generateContent` adapter.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{strip_code_fences, SynthesisError, SynthesisSpec, Synthesizer};

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const SYSTEM_INSTRUCTION: &str = "You are an expert Python code generator. \
Return exactly one public top-level function and nothing else: no explanations, no Markdown. \
The function takes a single argument and returns a JSON-serializable value. \
Annotate the parameter and the return type with built-in types (int, float, str, bool, list, dict). \
Only import from: json, re, math, datetime, typing, collections, itertools, functools, string, statistics. \
Never use eval, exec, open, subprocess, os, sys, or any network module.";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "gemini-2.0-flash".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.3,
            max_output_tokens: 4096,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_env() -> Result<Self, SynthesisError> {
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key)),
            _ => Err(SynthesisError::MissingApiKey(API_KEY_ENV)),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

/// Synthesizer calling a Gemini model over HTTP.
pub struct GeminiSynthesizer {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiSynthesizer {
    pub fn new(config: GeminiConfig) -> Result<Self, SynthesisError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("toolforge/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    pub fn from_env() -> Result<Self, SynthesisError> {
        Self::new(GeminiConfig::from_env()?)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.model
        )
    }
}

/// User prompt for one synthesis round.
pub fn build_prompt(spec: &SynthesisSpec) -> String {
    let mut prompt = format!("Task: {}\n", spec.task_description);
    if let Some(input) = &spec.io_hints.input_type {
        let _ = writeln!(prompt, "Input type: {input}");
    }
    if let Some(output) = &spec.io_hints.output_type {
        let _ = writeln!(prompt, "Output type: {output}");
    }
    if !spec.guidance.is_empty() {
        prompt.push_str("\nGuidance:\n");
        for line in &spec.guidance {
            let _ = writeln!(prompt, "- {line}");
        }
    }
    if let Some(feedback) = &spec.repair_feedback {
        let _ = write!(
            prompt,
            "\nThe previous attempt was rejected: {feedback}\nFix this problem in the new version.\n"
        );
    }
    prompt
}

fn extract_text(response: GenerateResponse) -> Result<String, SynthesisError> {
    let text: String = response
        .candidates
        .into_iter()
        .find_map(|c| c.content)
        .map(|content| content.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(SynthesisError::EmptyResponse);
    }
    Ok(text)
}

#[async_trait]
impl Synthesizer for GeminiSynthesizer {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn synthesize(&self, spec: &SynthesisSpec) -> Result<String, SynthesisError> {
        let request = GenerateRequest {
            system_instruction: Content {
                parts: vec![Part {
                    text: SYSTEM_INSTRUCTION.to_string(),
                }],
            },
            contents: vec![Content {
                parts: vec![Part {
                    text: build_prompt(spec),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
            },
        };

        debug!(model = %self.config.model, "requesting candidate");
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "generator request failed");
            return Err(SynthesisError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let text = extract_text(response.json::<GenerateResponse>().await?)?;
        Ok(strip_code_fences(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IoSpec, IoType};
    use crate::planner::Strategy;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the base URL.
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let _ = socket.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    fn spec() -> SynthesisSpec {
        SynthesisSpec::new(
            "sum a list",
            IoSpec::new(Some(IoType::List), Some(IoType::Int)),
            Strategy::ReflectiveRetry,
        )
        .with_guidance(vec!["Avoid RuntimeFault in similar tasks".into()])
        .with_feedback("disallowed modules: socket")
    }

    #[test]
    fn prompt_carries_hints_guidance_and_feedback() {
        let prompt = build_prompt(&spec());
        assert!(prompt.contains("Task: sum a list"));
        assert!(prompt.contains("Input type: list"));
        assert!(prompt.contains("Output type: int"));
        assert!(prompt.contains("- Avoid RuntimeFault"));
        assert!(prompt.contains("rejected: disallowed modules: socket"));
    }

    #[test]
    fn empty_candidates_are_an_error() {
        let response: GenerateResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(matches!(
            extract_text(response),
            Err(SynthesisError::EmptyResponse)
        ));
    }

    #[tokio::test]
    async fn successful_response_is_unfenced() {
        let body = serde_json::json!({
            "candidates": [{"content": {"parts": [
                {"text": "```python\ndef sum_list(numbers: list) -> int:\n    return sum(numbers)\n```"}
            ]}}]
        })
        .to_string();
        let base = serve_once("200 OK", body).await;
        let synth = GeminiSynthesizer::new(GeminiConfig::new("test-key").with_base_url(base)).unwrap();
        let source = synth.synthesize(&spec()).await.unwrap();
        assert_eq!(
            source,
            "def sum_list(numbers: list) -> int:\n    return sum(numbers)\n"
        );
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let base = serve_once("429 Too Many Requests", r#"{"error":"quota"}"#.to_string()).await;
        let synth = GeminiSynthesizer::new(GeminiConfig::new("test-key").with_base_url(base)).unwrap();
        let err = synth.synthesize(&spec()).await.unwrap_err();
        assert!(matches!(err, SynthesisError::Api { status: 429, .. }));
    }
}
