use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::image::split_data_uri;
use crate::models::Message;

/**
 * \brief 文本引擎调用参数（凭证已解析）。
 */
#[derive(Clone)]
pub struct TextEndpoint {
    pub vendor: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl std::fmt::Debug for TextEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextEndpoint")
            .field("vendor", &self.vendor)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    OpenAI,
    Gemini,
}

/**
 * \brief 判断 baseURL 是否为 OpenAI 兼容的第三方网关（而非 Gemini 官方接口）。
 */
pub fn is_openai_compatible(base_url: &str) -> bool {
    base_url.contains("gitaigc") || (base_url.contains("/v1") && !base_url.contains("/v1beta"))
}

fn provider_kind(endpoint: &TextEndpoint) -> ProviderKind {
    if endpoint.vendor == "google" && !is_openai_compatible(&endpoint.base_url) {
        ProviderKind::Gemini
    } else {
        ProviderKind::OpenAI
    }
}

/**
 * \brief 文本生成接口：输入消息，返回完整文本。
 */
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String>;
}

/**
 * \brief 基于 HTTP 的文本生成客户端，按厂商分派到 OpenAI 兼容或 Gemini 协议。
 */
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: TextEndpoint,
}

impl ChatClient {
    pub fn new(http: reqwest::Client, endpoint: TextEndpoint) -> Self {
        ChatClient { http, endpoint }
    }
}

#[async_trait]
impl TextGenerator for ChatClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let text = match provider_kind(&self.endpoint) {
            ProviderKind::OpenAI => chat_once_openai(&self.http, &self.endpoint, messages).await?,
            ProviderKind::Gemini => chat_once_gemini(&self.http, &self.endpoint, messages).await?,
        };
        if text.trim().is_empty() {
            return Err(anyhow!("empty completion from {}", self.endpoint.vendor));
        }
        Ok(text)
    }
}

/**
 * \brief 列出当前文本引擎可用模型列表。
 */
pub async fn list_models(http: &reqwest::Client, endpoint: &TextEndpoint) -> Result<Vec<String>> {
    match provider_kind(endpoint) {
        ProviderKind::OpenAI => list_models_openai(http, endpoint).await,
        ProviderKind::Gemini => list_models_gemini(http, endpoint).await,
    }
}

async fn chat_once_openai(
    http: &reqwest::Client,
    endpoint: &TextEndpoint,
    messages: &[Message],
) -> Result<String> {
    let url = format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/'));
    let body = json!({
        "model": endpoint.model,
        "messages": openai_messages(messages),
        "temperature": endpoint.temperature,
        "max_tokens": endpoint.max_tokens,
        "stream": false
    });

    let resp = http
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", endpoint.api_key))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("request failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    Ok(extract_openai_content(&v))
}

async fn list_models_openai(http: &reqwest::Client, endpoint: &TextEndpoint) -> Result<Vec<String>> {
    let url = format!("{}/models", endpoint.base_url.trim_end_matches('/'));
    let resp = http
        .get(url)
        .header(AUTHORIZATION, format!("Bearer {}", endpoint.api_key))
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("list models failed: {} -> {}", status, text));
    }
    parse_model_list(resp.json().await?)
}

async fn chat_once_gemini(
    http: &reqwest::Client,
    endpoint: &TextEndpoint,
    messages: &[Message],
) -> Result<String> {
    let base = normalize_gemini_base(&endpoint.base_url);
    let url = format!("{}/models/{}:generateContent", base, endpoint.model);
    let (system_prompt, contents) = gemini_payload(messages);

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": endpoint.temperature,
            "maxOutputTokens": endpoint.max_tokens
        }
    });
    if let Some(sys) = system_prompt {
        body["system_instruction"] = json!({
            "parts": [{"text": sys}]
        });
    }

    let resp = http
        .post(url)
        .query(&[("key", endpoint.api_key.as_str())])
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("gemini request failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    Ok(extract_gemini_content(&v))
}

async fn list_models_gemini(http: &reqwest::Client, endpoint: &TextEndpoint) -> Result<Vec<String>> {
    let base = normalize_gemini_base(&endpoint.base_url);
    let url = format!("{}/models", base);
    let resp = http
        .get(url)
        .query(&[("key", endpoint.api_key.as_str())])
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("gemini list models failed: {} -> {}", status, text));
    }
    parse_gemini_model_list(resp.json().await?)
}

/**
 * \brief OpenAI 消息体；带图片的消息改为 text + image_url 分段数组。
 */
fn openai_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            if msg.images.is_empty() {
                json!({"role": msg.role, "content": msg.content})
            } else {
                let mut parts = vec![json!({"type": "text", "text": msg.content})];
                parts.extend(
                    msg.images
                        .iter()
                        .map(|url| json!({"type": "image_url", "image_url": {"url": url}})),
                );
                json!({"role": msg.role, "content": parts})
            }
        })
        .collect()
}

fn extract_openai_content(v: &Value) -> String {
    let content = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"));
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn extract_gemini_content(v: &Value) -> String {
    if let Some(candidates) = v.get("candidates").and_then(|c| c.as_array()) {
        if let Some(first) = candidates.first() {
            if let Some(content) = first.get("content") {
                if let Some(parts) = content.get("parts").and_then(|p| p.as_array()) {
                    return parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("");
                }
            }
            if let Some(text) = first.get("output").and_then(|t| t.as_str()) {
                return text.to_string();
            }
        }
    }
    v.get("text")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .to_string()
}

fn gemini_image_part(image: &str) -> Value {
    match split_data_uri(image) {
        Some((mime, data)) => json!({"inlineData": {"mimeType": mime, "data": data}}),
        None => json!({"fileData": {"fileUri": image}}),
    }
}

fn gemini_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();
    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content.clone()),
            "assistant" => contents.push(json!({
                "role": "model",
                "parts": [{"text": msg.content}]
            })),
            _ => {
                let mut parts: Vec<Value> = msg.images.iter().map(|i| gemini_image_part(i)).collect();
                parts.push(json!({"text": msg.content}));
                contents.push(json!({
                    "role": "user",
                    "parts": parts
                }))
            }
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, contents)
}

fn parse_model_list(v: Value) -> Result<Vec<String>> {
    if let Some(arr) = v.get("data").and_then(|x| x.as_array()) {
        Ok(arr
            .iter()
            .filter_map(|item| item.get("id").and_then(|s| s.as_str()))
            .map(|s| s.to_string())
            .collect())
    } else if let Some(arr) = v.as_array() {
        Ok(arr
            .iter()
            .filter_map(|item| {
                item.get("id")
                    .and_then(|s| s.as_str())
                    .or_else(|| item.as_str())
            })
            .map(|s| s.to_string())
            .collect())
    } else {
        Err(anyhow!("unexpected models payload: {}", v))
    }
}

pub(crate) fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

fn parse_gemini_model_list(v: Value) -> Result<Vec<String>> {
    if let Some(arr) = v.get("models").and_then(|x| x.as_array()) {
        Ok(arr
            .iter()
            .filter_map(|item| {
                item.get("name")
                    .and_then(|s| s.as_str())
                    .or_else(|| item.get("id").and_then(|s| s.as_str()))
            })
            .map(|s| s.to_string())
            .collect())
    } else {
        Err(anyhow!("unexpected gemini models payload: {}", v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(vendor: &str, base: &str) -> TextEndpoint {
        TextEndpoint {
            vendor: vendor.to_string(),
            base_url: base.to_string(),
            api_key: "sk-test".to_string(),
            model: "m".to_string(),
            temperature: 0.9,
            max_tokens: 4096,
        }
    }

    #[test]
    fn test_provider_kind_dispatch() {
        let official = endpoint("google", "https://generativelanguage.googleapis.com/v1beta");
        assert_eq!(provider_kind(&official), ProviderKind::Gemini);
        let gateway = endpoint("google", "https://gitaigc.com/v1");
        assert_eq!(provider_kind(&gateway), ProviderKind::OpenAI);
        let volc = endpoint("volc", "https://ark.cn-beijing.volces.com/api/v3");
        assert_eq!(provider_kind(&volc), ProviderKind::OpenAI);
    }

    #[test]
    fn test_openai_messages_with_images_use_parts() {
        let mut user = Message::user("describe");
        user.images.push("https://img.example/a.png".to_string());
        let payload = openai_messages(&[Message::system("sys"), user]);
        assert_eq!(payload[0]["content"], "sys");
        assert_eq!(payload[1]["content"][0]["type"], "text");
        assert_eq!(payload[1]["content"][1]["image_url"]["url"], "https://img.example/a.png");
    }

    #[test]
    fn test_gemini_payload_splits_system_and_inlines_images() {
        let mut user = Message::user("hi");
        user.images.push("data:image/png;base64,AAAA".to_string());
        let (sys, contents) = gemini_payload(&[Message::system("rules"), user]);
        assert_eq!(sys.as_deref(), Some("rules"));
        assert_eq!(contents[0]["parts"][0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(contents[0]["parts"][1]["text"], "hi");
    }

    #[test]
    fn test_content_extractors() {
        let v = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_openai_content(&v), "hello");
        let v = json!({"choices": [{"message": {"content": [{"type": "text", "text": "a"}, {"text": "b"}]}}]});
        assert_eq!(extract_openai_content(&v), "ab");
        let v = json!({"candidates": [{"content": {"parts": [{"text": "x"}, {"text": "y"}]}}]});
        assert_eq!(extract_gemini_content(&v), "xy");
        assert_eq!(extract_openai_content(&json!({})), "");
    }

    #[test]
    fn test_model_lists() {
        let v = json!({"data": [{"id": "doubao"}, {"id": "deepseek"}]});
        assert_eq!(parse_model_list(v).unwrap(), vec!["doubao", "deepseek"]);
        let v = json!({"models": [{"name": "models/gemini-2.5-flash"}]});
        assert_eq!(parse_gemini_model_list(v).unwrap(), vec!["models/gemini-2.5-flash"]);
        assert!(parse_model_list(json!({"oops": 1})).is_err());
        assert_eq!(normalize_gemini_base("https://x.example/"), "https://x.example/v1beta");
    }
}
