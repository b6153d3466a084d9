//! Provider invocation.
//!
//! For each provider in the chosen group the router tries the endpoint
//! variants (`…/chat/completions`, then `…/responses`), accepts JSON with
//! text extractable from the fixed candidate paths, rejects HTML bodies, and
//! measures latency and estimated cost. When live calls are disabled (config
//! switch off, or the test guard env set) a local fallback response is
//! synthesized instead. Provider failures are carried inline; they never
//! raise into the pipeline.

use crate::config::LlmConfig;
use crate::error::ResidentError;
use crate::util::{clamp, clip, now_iso};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

// ============================================================================
// Route response
// ============================================================================

/// Memory-bias annotation attached when learned preferences reshaped the
/// candidate list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryBias {
    pub task_type: String,
    pub preferred_groups: Vec<String>,
    pub strength: String,
}

/// The full outcome of one routed generation, persisted as the
/// `provider_routes` detail payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteResponse {
    pub group: String,
    pub generated_at: String,
    pub summary: String,
    pub next_step: String,
    pub raw: String,
    pub provider: String,
    pub model: String,
    pub live_api: bool,
    pub latency_ms: i64,
    pub estimated_cost_usd: f64,
    pub task_type: String,
    pub error: Option<String>,
    // Routing annotations filled in by the caller.
    pub route_reason: String,
    pub route_candidates: Vec<String>,
    pub route_scores: BTreeMap<String, f64>,
    pub requested_group: String,
    pub effective_group: String,
    pub stability_override: Option<String>,
    pub memory_bias: Option<MemoryBias>,
}

impl RouteResponse {
    /// A live, error-free response from a real provider.
    pub fn is_success(&self) -> bool {
        self.live_api
            && self.error.is_none()
            && self.provider != "fallback-local"
            && self.provider != "-"
    }

    /// Fallback used: either a synthesized local response or no live call.
    pub fn used_fallback(&self) -> bool {
        self.provider == "fallback-local" || self.provider == "-" || !self.live_api
    }
}

// ============================================================================
// Invocation
// ============================================================================

struct ProviderReply {
    provider: String,
    model: String,
    text: String,
    #[allow(dead_code)]
    status: u16,
    latency_ms: i64,
}

/// Generate a structured response for the chosen group. Never errors: when no
/// provider succeeds (or live calls are disabled) the local fallback response
/// carries the collected error text inline.
pub async fn generate_structured_response(
    group: &str,
    prompt: &str,
    objective: &str,
    cfg: &LlmConfig,
    task_type: &str,
) -> RouteResponse {
    let text = prompt.trim();
    let objective = objective.trim();
    let summary = clip(if objective.is_empty() { text } else { objective }, 220).to_string();

    let mut errors: Vec<String> = Vec::new();
    if cfg.live_enabled() {
        let provider_seq: Vec<String> = cfg
            .provider_groups
            .get(group)
            .map(|names| names.iter().filter(|n| !n.trim().is_empty()).cloned().collect())
            .unwrap_or_default();
        for name in provider_seq {
            let Some(provider_cfg) = cfg.providers.get(&name) else {
                errors.push(format!("provider_not_found:{name}"));
                continue;
            };
            match call_provider_api(&name, provider_cfg, text, objective).await {
                Ok(reply) => {
                    let generated = reply.text.trim().to_string();
                    let generated_summary = if generated.is_empty() {
                        summary.clone()
                    } else {
                        clip(&generated, 220).to_string()
                    };
                    let cost = estimate_cost_usd(&reply.model, text, &generated);
                    return RouteResponse {
                        group: group.to_string(),
                        generated_at: now_iso(),
                        next_step: format!(
                            "Use {}({}) to execute: {}",
                            reply.provider,
                            reply.model,
                            clip(&generated_summary, 120)
                        ),
                        raw: format!("[{}:{}] {}", reply.provider, reply.model, clip(&generated, 1000)),
                        summary: generated_summary,
                        provider: reply.provider,
                        model: reply.model,
                        live_api: true,
                        latency_ms: reply.latency_ms,
                        estimated_cost_usd: cost,
                        task_type: task_type.to_string(),
                        error: None,
                        ..RouteResponse::default()
                    };
                }
                Err(err) => errors.push(err.to_string()),
            }
        }
    }

    RouteResponse {
        group: group.to_string(),
        generated_at: now_iso(),
        next_step: format!("Use {} to execute: {}", group, clip(&summary, 120)),
        raw: format!("[{}] {}", group, clip(text, 260)),
        summary,
        provider: "fallback-local".to_string(),
        model: "-".to_string(),
        live_api: false,
        latency_ms: 0,
        estimated_cost_usd: 0.0,
        task_type: task_type.to_string(),
        error: if errors.is_empty() {
            None
        } else {
            Some(clip(&errors.join("; "), 1000).to_string())
        },
        ..RouteResponse::default()
    }
}

async fn call_provider_api(
    name: &str,
    provider_cfg: &crate::config::ProviderConfig,
    prompt: &str,
    objective: &str,
) -> Result<ProviderReply, ResidentError> {
    let family = provider_cfg.provider.to_lowercase();
    if family != "api" && family != "zhipu" {
        return Err(ResidentError::Provider(format!("provider_not_supported:{name}:{family}")));
    }
    if !provider_cfg.enabled {
        return Err(ResidentError::Provider(format!("provider_disabled:{name}")));
    }

    let endpoint = crate::config::expand_env_tokens(provider_cfg.endpoint.trim());
    let model = provider_cfg.model.trim().to_string();
    let mut api_key = String::new();
    if !provider_cfg.key_env.trim().is_empty() {
        api_key = std::env::var(provider_cfg.key_env.trim()).unwrap_or_default().trim().to_string();
    }
    if api_key.is_empty() {
        api_key = provider_cfg.api_key.trim().to_string();
    }
    if endpoint.is_empty() || model.is_empty() {
        return Err(ResidentError::Provider(format!("provider_incomplete:{name}")));
    }
    if api_key.is_empty() {
        let key_env = if provider_cfg.key_env.trim().is_empty() { "-" } else { provider_cfg.key_env.trim() };
        return Err(ResidentError::Provider(format!("provider_key_missing:{name}:{key_env}")));
    }

    let timeout = Duration::from_secs_f64(clamp(provider_cfg.timeout_sec, 3.0, 90.0));
    let instructions = if objective.is_empty() {
        "Provide concise structured guidance."
    } else {
        objective
    };
    let client = reqwest::Client::new();
    let mut errors: Vec<String> = Vec::new();

    for url in candidate_urls(&endpoint) {
        let is_responses = url.ends_with("/responses");
        let payload = if is_responses {
            serde_json::json!({
                "model": model,
                "input": prompt,
                "instructions": instructions,
            })
        } else {
            serde_json::json!({
                "model": model,
                "messages": [
                    {"role": "system", "content": instructions},
                    {"role": "user", "content": prompt},
                ],
                "temperature": 0.35,
            })
        };

        let started = Instant::now();
        let response = client
            .post(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                errors.push(format!("transport_error@{url}:{err}"));
                continue;
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                errors.push(format!("body_error@{url}:{err}"));
                continue;
            }
        };
        if !status.is_success() {
            errors.push(format!("http_{}@{}:{}", status.as_u16(), url, clip(&body, 160)));
            continue;
        }

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
        let out_text = extract_text(&parsed);
        let probe = if out_text.is_empty() { body.as_str() } else { out_text.as_str() };
        let probe_low = probe.trim_start().to_lowercase();
        if content_type.contains("text/html")
            || probe_low.starts_with("<!doctype html")
            || probe_low.starts_with("<html")
        {
            errors.push(format!("html_response@{url}"));
            continue;
        }
        let out_text = if out_text.is_empty() { body.trim().to_string() } else { out_text };
        if out_text.is_empty() {
            errors.push(format!("empty_response@{url}"));
            continue;
        }

        debug!("provider {} answered via {}", name, url);
        return Ok(ProviderReply {
            provider: name.to_string(),
            model,
            text: out_text,
            status: status.as_u16(),
            latency_ms: started.elapsed().as_millis() as i64,
        });
    }

    let joined = if errors.is_empty() {
        format!("all_attempts_failed:{name}")
    } else {
        clip(&errors.join(" ; "), 1200).to_string()
    };
    Err(ResidentError::Provider(joined))
}

// ============================================================================
// Endpoint variants
// ============================================================================

/// Deterministic, bounded endpoint-variant list; no retry middleware.
pub fn candidate_urls(endpoint: &str) -> Vec<String> {
    let ep = endpoint.trim().trim_end_matches('/');
    if ep.is_empty() {
        return Vec::new();
    }
    if ep.ends_with("/chat/completions") || ep.ends_with("/responses") {
        return vec![ep.to_string()];
    }
    if ep.ends_with("/v1") {
        return vec![format!("{ep}/chat/completions"), format!("{ep}/responses")];
    }
    vec![
        format!("{ep}/v1/chat/completions"),
        format!("{ep}/v1/responses"),
    ]
}

// ============================================================================
// Text extraction
// ============================================================================

/// First non-empty of the fixed candidate paths:
/// `choices[0].message.content`, `choices[0].text`, `output_text`, the
/// `output[*].content[*].text` aggregation, then the generic fallbacks.
pub fn extract_text(payload: &serde_json::Value) -> String {
    if let Some(s) = payload.as_str() {
        return s.to_string();
    }
    if let Some(choice) = payload.get("choices").and_then(|c| c.get(0)) {
        if let Some(content) = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
        {
            if !content.trim().is_empty() {
                return content.to_string();
            }
        }
        if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
            if !text.trim().is_empty() {
                return text.to_string();
            }
        }
    }
    if let Some(text) = payload.get("output_text").and_then(|t| t.as_str()) {
        if !text.trim().is_empty() {
            return text.to_string();
        }
    }
    if let Some(output) = payload.get("output").and_then(|o| o.as_array()) {
        let mut chunks: Vec<&str> = Vec::new();
        for item in output {
            let Some(content) = item.get("content").and_then(|c| c.as_array()) else {
                continue;
            };
            for part in content {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if !text.trim().is_empty() {
                        chunks.push(text);
                    }
                }
            }
        }
        if !chunks.is_empty() {
            return chunks.join("\n");
        }
    }
    for key in ["answer", "result", "content", "text"] {
        if let Some(value) = payload.get(key).and_then(|v| v.as_str()) {
            if !value.trim().is_empty() {
                return value.to_string();
            }
        }
    }
    String::new()
}

// ============================================================================
// Cost estimation
// ============================================================================

/// Per-1k-token rate ladder matched by model-name substring;
/// `tokens ~= max(1, chars / 4)`.
pub fn estimate_cost_usd(model: &str, prompt_text: &str, output_text: &str) -> f64 {
    const TIERS: &[(&str, f64, f64)] = &[
        ("gpt-5.3-codex-xhigh", 0.015, 0.06),
        ("gpt-5.2-codex-high", 0.012, 0.05),
        ("claude-opus", 0.015, 0.075),
        ("deepseek", 0.002, 0.008),
        ("gemini", 0.0012, 0.004),
        ("glm-4.5", 0.0008, 0.002),
        ("glm-4", 0.0006, 0.0018),
        ("nano", 0.00015, 0.0006),
        ("qwen", 0.0004, 0.0012),
    ];
    let name = model.to_lowercase();
    let (mut in_rate, mut out_rate) = (0.0008, 0.0024);
    for (key, ir, or) in TIERS {
        if name.contains(key) {
            in_rate = *ir;
            out_rate = *or;
            break;
        }
    }
    let in_tokens = (prompt_text.len() as f64 / 4.0).max(1.0);
    let out_tokens = (output_text.len() as f64 / 4.0).max(1.0);
    let cost = (in_tokens / 1000.0) * in_rate + (out_tokens / 1000.0) * out_rate;
    (cost * 1_000_000.0).round() / 1_000_000.0
}
