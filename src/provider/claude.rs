//! Generation through the `claude` CLI in print mode.
//!
//! The prompt is written to stdin and the single JSON result object is read
//! from stdout. Failures are classified from the result text and stderr.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{GenerationClient, GenerationRequest, GenerationResponse, ModelTier, TokenUsage};
use crate::config::ProviderConfig;
use crate::errors::ProviderError;

static RETRY_AFTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)retry[- ]after[^0-9]{0,4}(\d+)").unwrap());

pub struct ClaudeCliClient {
    cmd: String,
    primary_model: String,
    economy_model: String,
    timeout: Duration,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CliResult {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: Option<CliUsage>,
}

#[derive(Debug, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl ClaudeCliClient {
    pub fn new(config: &ProviderConfig, api_key: Option<String>) -> Self {
        Self {
            cmd: config.claude_cmd.clone(),
            primary_model: config.primary_model.clone(),
            economy_model: config.economy_model.clone(),
            timeout: config.request_timeout(),
            api_key,
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => &self.primary_model,
            ModelTier::Economy => &self.economy_model,
        }
    }

    async fn run(&self, request: &GenerationRequest, model: &str) -> Result<String, ProviderError> {
        let mut cmd = Command::new(&self.cmd);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(model);
        if !request.system.is_empty() {
            cmd.arg("--append-system-prompt").arg(&request.system);
        }
        cmd.env("CLAUDE_CODE_MAX_OUTPUT_TOKENS", request.max_tokens.to_string());
        if let Some(key) = &self.api_key {
            cmd.env("ANTHROPIC_API_KEY", key);
        }

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Fatal(format!("Failed to spawn {}: {}", self.cmd, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| ProviderError::Transient(format!("Failed to write prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| ProviderError::Transient(format!("Failed to close stdin: {}", e)))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout))?
            .map_err(|e| ProviderError::Transient(format!("Claude process failed: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && stdout.trim().is_empty() {
            return Err(classify_failure(&stderr));
        }
        Ok(stdout.into_owned())
    }
}

#[async_trait]
impl GenerationClient for ClaudeCliClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let model = self.model_for(request.tier).to_string();
        tracing::debug!(model = %model, label = %request.label, chars = request.prompt.len(), "claude request");
        let stdout = self.run(request, &model).await?;
        let (text, usage) = parse_cli_output(&stdout)?;
        Ok(GenerationResponse { text, usage, model })
    }
}

/// Parse the print-mode JSON result into text and usage.
pub fn parse_cli_output(stdout: &str) -> Result<(String, TokenUsage), ProviderError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    // Some CLI versions print a JSON array of events; the result is the last object.
    let parsed: Option<CliResult> = serde_json::from_str::<CliResult>(trimmed).ok().or_else(|| {
        serde_json::from_str::<Vec<serde_json::Value>>(trimmed)
            .ok()
            .and_then(|events| {
                events
                    .into_iter()
                    .rev()
                    .find(|e| e.get("type").and_then(|t| t.as_str()) == Some("result"))
            })
            .and_then(|e| serde_json::from_value(e).ok())
    });

    let Some(result) = parsed else {
        // Plain text output.
        return Ok((trimmed.to_string(), TokenUsage::default()));
    };

    let text = result.result.unwrap_or_default();
    if result.is_error {
        return Err(classify_failure(&text));
    }
    if text.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    let usage = result
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.input_tokens + u.cache_read_input_tokens + u.cache_creation_input_tokens,
            output_tokens: u.output_tokens,
        })
        .unwrap_or_default();
    Ok((text, usage))
}

/// Map provider error text onto the error taxonomy.
pub fn classify_failure(message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests")
    {
        let retry_after = RETRY_AFTER
            .captures(message)
            .and_then(|c| c[1].parse::<u64>().ok())
            .map(Duration::from_secs);
        return ProviderError::RateLimited { retry_after };
    }
    if lower.contains("prompt is too long")
        || lower.contains("context window")
        || lower.contains("context length")
        || lower.contains("maximum context")
    {
        return ProviderError::ContextOverflow;
    }
    if lower.contains("overloaded")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection")
        || ["500", "502", "503", "504", "529"]
            .iter()
            .any(|code| lower.contains(code))
    {
        return ProviderError::Transient(first_line(message));
    }
    ProviderError::Fatal(first_line(message))
}

fn first_line(message: &str) -> String {
    message
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("unknown provider error")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_object() {
        let out = r#"{"type":"result","subtype":"success","is_error":false,"result":"hello","usage":{"input_tokens":10,"cache_read_input_tokens":5,"output_tokens":3}}"#;
        let (text, usage) = parse_cli_output(out).unwrap();
        assert_eq!(text, "hello");
        assert_eq!(usage.input_tokens, 15);
        assert_eq!(usage.output_tokens, 3);
    }

    #[test]
    fn test_parse_event_array() {
        let out = r#"[{"type":"system"},{"type":"result","result":"done","usage":{"input_tokens":1,"output_tokens":2}}]"#;
        let (text, usage) = parse_cli_output(out).unwrap();
        assert_eq!(text, "done");
        assert_eq!(usage.total(), 3);
    }

    #[test]
    fn test_parse_empty_and_error_results() {
        assert_eq!(parse_cli_output("  "), Err(ProviderError::EmptyResponse));
        assert_eq!(
            parse_cli_output(r#"{"result":"","is_error":false}"#),
            Err(ProviderError::EmptyResponse)
        );
        assert_eq!(
            parse_cli_output(r#"{"result":"Prompt is too long","is_error":true}"#),
            Err(ProviderError::ContextOverflow)
        );
    }

    #[test]
    fn test_plain_text_passthrough() {
        let (text, usage) = parse_cli_output("just text\n").unwrap();
        assert_eq!(text, "just text");
        assert_eq!(usage, TokenUsage::default());
    }

    #[test]
    fn test_classify_failures() {
        assert_eq!(
            classify_failure("Error: 429 rate limit exceeded, retry after 12 seconds"),
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(12))
            }
        );
        assert!(matches!(
            classify_failure("API Error: 529 overloaded"),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            classify_failure("\ninvalid x-api-key\n"),
            ProviderError::Fatal(m) if m == "invalid x-api-key"
        ));
    }
}
