//! 配图管线：参考图预处理（抠图，失败退化为原图）、提示词组装，以及两种厂商协议的适配器。

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::imageseg::Segmenter;
use crate::llm::{is_openai_compatible, normalize_gemini_base};
use crate::models::RefImage;

/** \brief 1x1 白色 PNG，无参考图时作为可编辑输入。 */
pub const BLANK_PNG_DATA_URI: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mP8Xw8AAmMB9qA7qjYAAAAASUVORK5CYII=";

pub const MAX_REFERENCE_IMAGES: usize = 3;

const NEGATIVE_WITHOUT_REFS: &str = "低质量, 低分辨率, 模糊, 强烈AI感, 水印, 二维码";
const NEGATIVE_WITH_REFS: &str = "低质量, 低分辨率, 模糊, 强烈AI感, 产品主体变形, 产品外观改变, 颜色改变, Logo改变, 材质改变, 比例不对, 结构错误, 多余商品, 多余配件, 水印, 二维码";

/**
 * \brief 拆分 data URI，返回 (mime, base64)。
 */
pub fn split_data_uri(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    Some((mime, data))
}

/**
 * \brief 取 base64 部分；非 data URI 原样返回。
 */
pub fn strip_data_uri(s: &str) -> &str {
    match s.find("base64,") {
        Some(idx) => &s[idx + "base64,".len()..],
        None => s,
    }
}

pub fn png_data_uri(b64: &str) -> String {
    format!("data:image/png;base64,{b64}")
}

/**
 * \brief 厂商返回的图片：远程 URL 或 base64。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutput {
    Url(String),
    Base64(String),
}

impl ImageOutput {
    /** \brief 统一为可直接引用的地址，base64 编码为 data URI。 */
    pub fn into_url(self) -> String {
        match self {
            ImageOutput::Url(url) => url,
            ImageOutput::Base64(b64) => png_data_uri(&b64),
        }
    }
}

/**
 * \brief 配图引擎调用参数（凭证已解析）。
 */
#[derive(Clone)]
pub struct ImageEndpoint {
    pub vendor: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/**
 * \brief 发往厂商的最终请求。
 */
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    /** \brief 参考图 data URI，至少一张 */
    pub references: Vec<String>,
    pub prompt_extend: bool,
}

/**
 * \brief 配图厂商适配器。
 */
#[async_trait]
pub trait ImageVendorAdapter: Send + Sync {
    async fn generate(&self, endpoint: &ImageEndpoint, req: &ImageRequest) -> Result<ImageOutput>;
}

/**
 * \brief 多模态对话协议（DashScope qwen-image-edit 系列）。
 */
pub struct DashscopeAdapter {
    http: reqwest::Client,
}

impl DashscopeAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        DashscopeAdapter { http }
    }
}

fn dashscope_payload(model: &str, req: &ImageRequest) -> Value {
    let mut content: Vec<Value> = req.references.iter().map(|img| json!({"image": img})).collect();
    content.push(json!({"text": req.prompt}));
    json!({
        "model": model,
        "input": {
            "messages": [{"role": "user", "content": content}]
        },
        "parameters": {
            "n": 1,
            "negative_prompt": req.negative_prompt,
            "prompt_extend": req.prompt_extend,
            "watermark": false
        }
    })
}

fn parse_dashscope_output(v: &Value) -> Result<ImageOutput> {
    v.pointer("/output/choices/0/message/content")
        .and_then(|c| c.as_array())
        .and_then(|parts| {
            parts
                .iter()
                .find_map(|p| p.get("image").and_then(|i| i.as_str()))
        })
        .map(|url| ImageOutput::Url(url.to_string()))
        .ok_or_else(|| anyhow!("生图无结果: {}", v))
}

#[async_trait]
impl ImageVendorAdapter for DashscopeAdapter {
    async fn generate(&self, endpoint: &ImageEndpoint, req: &ImageRequest) -> Result<ImageOutput> {
        let url = format!(
            "{}/services/aigc/multimodal-generation/generation",
            endpoint.base_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", endpoint.api_key))
            .json(&dashscope_payload(&endpoint.model, req))
            .send()
            .await?;
        let status = resp.status();
        let v: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let msg = v.get("message").and_then(|m| m.as_str()).unwrap_or("生图失败");
            return Err(anyhow!("dashscope request failed: {} -> {}", status, msg));
        }
        parse_dashscope_output(&v)
    }
}

/**
 * \brief generateContent 协议（Gemini 图片模型）；OpenAI 兼容网关走 chat/completions。
 */
pub struct GeminiImageAdapter {
    http: reqwest::Client,
}

impl GeminiImageAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        GeminiImageAdapter { http }
    }
}

fn gemini_image_payload(req: &ImageRequest) -> Value {
    let mut parts: Vec<Value> = req
        .references
        .iter()
        .map(|img| {
            let (mime, data) = split_data_uri(img).unwrap_or(("image/png", strip_data_uri(img)));
            json!({"inlineData": {"mimeType": mime, "data": data}})
        })
        .collect();
    parts.push(json!({"text": req.prompt}));
    json!({"contents": [{"parts": parts}]})
}

fn parse_gemini_image(v: &Value) -> Result<ImageOutput> {
    let parts = v
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| anyhow!("Google API 返回空结果"))?;
    parts
        .iter()
        .find_map(|p| {
            p.get("inlineData")
                .or_else(|| p.get("inline_data"))
                .and_then(|d| d.get("data"))
                .and_then(|d| d.as_str())
        })
        .map(|data| ImageOutput::Base64(data.to_string()))
        .ok_or_else(|| anyhow!("Google API 响应中未找到图片数据"))
}

fn chat_image_payload(model: &str, req: &ImageRequest) -> Value {
    let mut content: Vec<Value> = req
        .references
        .iter()
        .map(|img| json!({"type": "image_url", "image_url": {"url": img}}))
        .collect();
    content.push(json!({"type": "text", "text": req.prompt}));
    json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
        "temperature": 0.7,
        "max_tokens": 4000
    })
}

static MD_DATA_IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"!\[[^\]]*\]\(data:image/[^;]+;base64,([A-Za-z0-9+/=]+)\)").expect("markdown image regex")
});
static DATA_IMAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"data:image/[^;]+;base64,([A-Za-z0-9+/=]+)").expect("data image regex"));
static IMAGE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(https?://[^\s)]+?\.(?:png|jpe?g|gif|webp))").expect("image url regex")
});
static BASE64_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/=]+$").expect("base64 regex"));

fn image_from_text(text: &str) -> Option<ImageOutput> {
    if let Some(c) = MD_DATA_IMAGE_RE.captures(text) {
        return Some(ImageOutput::Base64(c[1].to_string()));
    }
    if let Some(c) = DATA_IMAGE_RE.captures(text) {
        return Some(ImageOutput::Base64(c[1].to_string()));
    }
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() > 1000 && BASE64_RE.is_match(&compact) {
        return Some(ImageOutput::Base64(compact));
    }
    IMAGE_URL_RE
        .captures(text)
        .map(|c| ImageOutput::Url(c[1].to_string()))
}

/**
 * \brief 从 OpenAI 兼容响应中提取图片：image_url 分段、Markdown/data URI、长 base64 或图片链接。
 */
fn parse_chat_image(v: &Value) -> Result<ImageOutput> {
    let content = v
        .pointer("/choices/0/message/content")
        .ok_or_else(|| anyhow!("第三方平台返回空结果"))?;
    let found = match content {
        Value::Array(parts) => parts.iter().find_map(|part| {
            if let Some(url) = part.pointer("/image_url/url").and_then(|u| u.as_str()) {
                return match split_data_uri(url) {
                    Some((_, data)) => Some(ImageOutput::Base64(data.to_string())),
                    None => Some(ImageOutput::Url(url.to_string())),
                };
            }
            part.get("text").and_then(|t| t.as_str()).and_then(image_from_text)
        }),
        Value::String(text) => image_from_text(text),
        _ => None,
    };
    found.ok_or_else(|| anyhow!("第三方平台返回的内容格式无法解析为图片"))
}

#[async_trait]
impl ImageVendorAdapter for GeminiImageAdapter {
    async fn generate(&self, endpoint: &ImageEndpoint, req: &ImageRequest) -> Result<ImageOutput> {
        if is_openai_compatible(&endpoint.base_url) {
            let url = format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/'));
            let resp = self
                .http
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, format!("Bearer {}", endpoint.api_key))
                .json(&chat_image_payload(&endpoint.model, req))
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(anyhow!("image gateway request failed: {} -> {}", status, text));
            }
            let v: Value = resp.json().await?;
            return parse_chat_image(&v);
        }

        let base = normalize_gemini_base(&endpoint.base_url);
        let url = format!("{}/models/{}:generateContent", base, endpoint.model);
        let resp = self
            .http
            .post(url)
            .query(&[("key", endpoint.api_key.as_str())])
            .json(&gemini_image_payload(req))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("gemini image request failed: {} -> {}", status, text));
        }
        let v: Value = resp.json().await?;
        parse_gemini_image(&v)
    }
}

/**
 * \brief 厂商 -> 适配器；未注册的厂商走多模态对话协议。
 */
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ImageVendorAdapter>>,
    fallback: Arc<dyn ImageVendorAdapter>,
}

impl AdapterRegistry {
    pub fn new(fallback: Arc<dyn ImageVendorAdapter>) -> Self {
        AdapterRegistry {
            adapters: HashMap::new(),
            fallback,
        }
    }

    pub fn with_defaults(http: reqwest::Client) -> Self {
        let dashscope: Arc<dyn ImageVendorAdapter> = Arc::new(DashscopeAdapter::new(http.clone()));
        let mut registry = AdapterRegistry::new(dashscope.clone());
        registry.register("dashscope", dashscope);
        registry.register("google", Arc::new(GeminiImageAdapter::new(http)));
        registry
    }

    pub fn register(&mut self, vendor: &str, adapter: Arc<dyn ImageVendorAdapter>) {
        self.adapters.insert(vendor.to_string(), adapter);
    }

    pub fn get(&self, vendor: &str) -> Arc<dyn ImageVendorAdapter> {
        self.adapters
            .get(vendor)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/**
 * \brief 单张配图任务（用户输入）。
 */
#[derive(Debug, Clone, Default)]
pub struct ImageJob {
    pub product_name: String,
    pub prompt: String,
    pub positive_prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub images: Vec<RefImage>,
    pub primary_index: Option<usize>,
}

impl ImageJob {
    /**
     * \brief 有效参考图：过滤空图，主图置首，最多三张。
     */
    pub fn references(&self) -> Vec<RefImage> {
        let mut list: Vec<RefImage> = self
            .images
            .iter()
            .filter(|img| !img.data_url.trim().is_empty())
            .cloned()
            .collect();
        if let Some(idx) = self.primary_index.filter(|i| *i > 0 && *i < list.len()) {
            let primary = list.remove(idx);
            list.insert(0, primary);
        }
        list.truncate(MAX_REFERENCE_IMAGES);
        list
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/**
 * \brief 组装最终提示词：用户提示词、正反向补充、参考图备注、硬性约束。
 */
pub fn compose_prompt(job: &ImageJob, refs: &[RefImage]) -> String {
    let mut lines: Vec<String> = vec![job.prompt.clone()];
    if let Some(p) = non_blank(&job.positive_prompt) {
        lines.push(format!("用户正向补充：{p}"));
    }
    if let Some(n) = non_blank(&job.negative_prompt) {
        lines.push(format!("用户反向补充：{n}"));
    }
    if !refs.is_empty() {
        let notes: Vec<String> = refs
            .iter()
            .enumerate()
            .map(|(i, img)| match non_blank(&img.note) {
                Some(note) => format!("图{}备注：{}", i + 1, note),
                None => format!("图{}备注：无", i + 1),
            })
            .collect();
        lines.push(format!("参考图备注：\n{}", notes.join("\n")));
        lines.push("硬性要求：如果画面出现产品，必须严格参考输入图产品，外观/颜色/Logo/材质/结构/比例/纹理细节完全不变，不得改动产品主体，不得重绘变形；禁止生成多余商品/配件；整体像真实拍摄。".to_string());
    } else {
        lines.push(format!(
            "要求：根据“产品名称+卖点”随机生成符合小红书审美的配图风格，不要生成水印/二维码。产品外观尽量贴合：{}。",
            job.product_name
        ));
    }
    lines.join("\n")
}

pub fn default_negative_prompt(has_refs: bool) -> &'static str {
    if has_refs {
        NEGATIVE_WITH_REFS
    } else {
        NEGATIVE_WITHOUT_REFS
    }
}

/**
 * \brief 并发抠图；单张失败时保留原图，不中断请求。
 */
pub async fn prepare_references(refs: &[RefImage], segmenter: Option<&dyn Segmenter>) -> Vec<String> {
    if refs.is_empty() {
        return vec![BLANK_PNG_DATA_URI.to_string()];
    }
    let Some(segmenter) = segmenter else {
        return refs.iter().map(|r| r.data_url.clone()).collect();
    };
    let tasks = refs.iter().enumerate().map(|(i, r)| async move {
        match segmenter.segment(strip_data_uri(&r.data_url)).await {
            Ok(cutout) => png_data_uri(&cutout),
            Err(err) => {
                tracing::warn!(index = i, error = %err, "segmentation failed, using original image");
                r.data_url.clone()
            }
        }
    });
    join_all(tasks).await
}

/**
 * \brief 配图管线的可调参数（来自引擎配置）。
 */
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub configured_negative_prompt: Option<String>,
    pub prompt_extend: bool,
}

/**
 * \brief 执行单张配图：预处理参考图、组装提示词、调用厂商。
 */
pub async fn generate_image(
    job: &ImageJob,
    endpoint: &ImageEndpoint,
    adapter: &dyn ImageVendorAdapter,
    segmenter: Option<&dyn Segmenter>,
    options: &PipelineOptions,
) -> Result<ImageOutput> {
    let refs = job.references();
    let references = prepare_references(&refs, segmenter).await;
    let negative_prompt = non_blank(&job.negative_prompt)
        .or_else(|| non_blank(&options.configured_negative_prompt))
        .unwrap_or_else(|| default_negative_prompt(!refs.is_empty()))
        .to_string();
    let req = ImageRequest {
        prompt: compose_prompt(job, &refs),
        negative_prompt,
        references,
        prompt_extend: options.prompt_extend,
    };
    tracing::info!(
        vendor = %endpoint.vendor,
        model = %endpoint.model,
        references = req.references.len(),
        "generating image"
    );
    adapter.generate(endpoint, &req).await
}
