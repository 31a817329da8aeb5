//! 生成-校验-重试循环，以及配图提示词、文案两类结果的解析与校验。

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::json_extract;
use crate::llm::TextGenerator;
use crate::models::{CopyOption, Message};

/**
 * \brief 重试策略：固定次数，无退避；单次调用可选超时。
 */
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: None,
        }
    }
}

/**
 * \brief 循环结果；degraded 为真表示用尽次数后返回了兜底值。
 */
#[derive(Debug, Clone)]
pub struct GenerationOutcome<T> {
    pub value: T,
    pub attempts: usize,
    pub degraded: bool,
    /** \brief 最后一次失败的原因 */
    pub failures: Vec<String>,
}

/**
 * \brief 一次生成请求的固定部分。
 */
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub system: Option<&'a str>,
    pub prompt: &'a str,
    pub images: &'a [String],
}

fn retry_suffix(failures: &[String]) -> String {
    format!(
        "\n上一次输出不合格，请严格修正并重新输出。\n错误明细：{}\n",
        failures.join("；")
    )
}

fn build_messages(req: &GenerationRequest<'_>, content: String) -> Vec<Message> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = req.system {
        messages.push(Message::system(system));
    }
    let mut user = Message::user(content);
    user.images = req.images.to_vec();
    messages.push(user);
    messages
}

/**
 * \brief 调用厂商并校验，失败时把错误明细拼回提示词重试；用尽次数后返回兜底值。
 * \details 厂商报错与超时同样消耗一次尝试。
 */
pub async fn generate_validated<T, F>(
    generator: &dyn TextGenerator,
    req: &GenerationRequest<'_>,
    policy: RetryPolicy,
    check: F,
    fallback: T,
) -> GenerationOutcome<T>
where
    F: Fn(&str) -> Result<T, Vec<String>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut failures: Vec<String> = Vec::new();

    for attempt in 0..max_attempts {
        let content = if attempt == 0 {
            req.prompt.to_string()
        } else {
            format!("{}{}", req.prompt, retry_suffix(&failures))
        };
        let messages = build_messages(req, content);

        let call = generator.complete(&messages);
        let result = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => Err(anyhow::anyhow!("调用超时({}ms)", limit.as_millis())),
            },
            None => call.await,
        };

        match result {
            Ok(raw) => match check(&raw) {
                Ok(value) => {
                    tracing::info!(attempt, "generation attempt passed validation");
                    return GenerationOutcome {
                        value,
                        attempts: attempt + 1,
                        degraded: false,
                        failures: Vec::new(),
                    };
                }
                Err(errs) => {
                    tracing::warn!(attempt, errors = %errs.join("；"), "generation attempt failed validation");
                    failures = errs;
                }
            },
            Err(err) => {
                tracing::warn!(attempt, error = %err, "generation attempt failed");
                failures = vec![format!("调用失败：{err}")];
            }
        }
    }

    tracing::warn!(
        attempts = max_attempts,
        errors = %failures.join("；"),
        "all attempts failed, returning fallback"
    );
    GenerationOutcome {
        value: fallback,
        attempts: max_attempts,
        degraded: true,
        failures,
    }
}

/**
 * \brief 配图提示词校验边界（字符数，闭区间）。
 */
#[derive(Debug, Clone, Copy)]
pub struct ImagePromptLimits {
    pub count: usize,
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for ImagePromptLimits {
    fn default() -> Self {
        ImagePromptLimits {
            count: 6,
            min_chars: 16,
            max_chars: 220,
        }
    }
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

pub fn validate_image_prompts(list: &[String], limits: &ImagePromptLimits) -> Vec<String> {
    let mut errors = Vec::new();
    if list.len() != limits.count {
        errors.push(format!("数量不等于{}(当前{})", limits.count, list.len()));
    }
    for (i, p) in list.iter().enumerate() {
        let len = p.chars().count();
        if len == 0 {
            errors.push(format!("第{}条:为空", i + 1));
        } else if len < limits.min_chars || len > limits.max_chars {
            errors.push(format!("第{}条:长度不合规({})", i + 1, len));
        }
    }
    errors
}

/**
 * \brief 解析并校验配图提示词数组。
 */
pub fn parse_image_prompts(raw: &str, limits: &ImagePromptLimits) -> Result<Vec<String>, Vec<String>> {
    let items = json_extract::extract_array(raw).ok_or_else(|| vec!["解析失败".to_string()])?;
    let prompts: Vec<String> = items.iter().map(value_to_text).collect();
    let errors = validate_image_prompts(&prompts, limits);
    if errors.is_empty() {
        Ok(prompts)
    } else {
        Err(errors)
    }
}

/**
 * \brief 文案校验边界（字符数、个数均为闭区间）。
 */
#[derive(Debug, Clone, Copy)]
pub struct CopyLimits {
    pub options: usize,
    pub title_chars: (usize, usize),
    pub title_emoji: (usize, usize),
    pub body_chars: (usize, usize),
    pub paragraphs: (usize, usize),
    pub tags: (usize, usize),
}

impl Default for CopyLimits {
    fn default() -> Self {
        CopyLimits {
            options: 2,
            title_chars: (6, 40),
            title_emoji: (1, 6),
            body_chars: (100, 800),
            paragraphs: (1, 12),
            tags: (3, 10),
        }
    }
}

static TAG_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[，,、\s]+").expect("tag split regex"));

/**
 * \brief 粗略判断 Emoji（不计变体选择符与连接符）。
 */
pub fn is_emoji(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2300..=0x23FF | 0x2B00..=0x2BFF
    )
}

pub fn count_emoji(s: &str) -> usize {
    s.chars().filter(|c| is_emoji(*c)).count()
}

fn first_str<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(|x| x.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn normalize_tags(v: &Value) -> Vec<String> {
    let raw: Vec<String> = match v.get("tags").or_else(|| v.get("Tags")) {
        Some(Value::Array(items)) => items.iter().map(value_to_text).collect(),
        Some(Value::String(s)) => TAG_SPLIT_RE.split(s).map(str::to_string).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|t| t.trim().trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/**
 * \brief 宽松读取单篇文案：兼容 Title/Body/content 等别名，还原转义换行。
 */
fn option_from_value(v: &Value) -> Option<CopyOption> {
    let title = first_str(v, &["title", "Title"])?;
    let body = first_str(v, &["body", "Body", "content", "Content"])?;
    Some(CopyOption {
        title: title.to_string(),
        body: body.replace("\\n", "\n"),
        tags: normalize_tags(v),
    })
}

pub fn validate_copy_option(index: usize, opt: &CopyOption, limits: &CopyLimits) -> Vec<String> {
    let n = index + 1;
    let mut errors = Vec::new();
    let in_range = |v: usize, (lo, hi): (usize, usize)| v >= lo && v <= hi;

    let title_len = opt.title.chars().count();
    if !in_range(title_len, limits.title_chars) {
        errors.push(format!("第{n}篇标题长度不合规({title_len})"));
    }
    let emoji = count_emoji(&opt.title);
    if !in_range(emoji, limits.title_emoji) {
        errors.push(format!("第{n}篇标题Emoji数量不合规({emoji})"));
    }
    let body_len = opt.body.chars().count();
    if !in_range(body_len, limits.body_chars) {
        errors.push(format!("第{n}篇正文长度不合规({body_len})"));
    }
    let paragraphs = opt.body.lines().filter(|l| !l.trim().is_empty()).count();
    if !in_range(paragraphs, limits.paragraphs) {
        errors.push(format!("第{n}篇段落数不合规({paragraphs})"));
    }
    if !in_range(opt.tags.len(), limits.tags) {
        errors.push(format!("第{n}篇标签数量不合规({})", opt.tags.len()));
    }
    errors
}

/**
 * \brief 解析并校验文案；接受 `{"options":[...]}`、数组或单个对象。
 */
pub fn parse_copy_options(raw: &str, limits: &CopyLimits) -> Result<Vec<CopyOption>, Vec<String>> {
    let parsed = json_extract::extract_any(raw).ok_or_else(|| vec!["解析失败".to_string()])?;
    let items: Vec<Value> = match parsed {
        Value::Array(items) => items,
        Value::Object(ref map) => match map.get("options").or_else(|| map.get("Options")) {
            Some(Value::Array(items)) => items.clone(),
            _ => vec![parsed.clone()],
        },
        _ => return Err(vec!["解析失败".to_string()]),
    };

    let mut errors = Vec::new();
    let mut options = Vec::new();
    for (i, item) in items.iter().enumerate() {
        match option_from_value(item) {
            Some(opt) => options.push(opt),
            None => errors.push(format!("第{}篇缺少 title/body", i + 1)),
        }
    }
    if items.len() != limits.options {
        errors.push(format!("数量不等于{}(当前{})", limits.options, items.len()));
    }
    for (i, opt) in options.iter().enumerate() {
        errors.extend(validate_copy_option(i, opt, limits));
    }
    if options.len() >= 2 && (options[0] == options[1] || options[0].title == options[1].title) {
        errors.push("两篇文案重复，请换不同角度".to_string());
    }

    if errors.is_empty() {
        Ok(options)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /** 按顺序回放预设响应，记录每次收到的提示词。 */
    struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<String>>>,
        repeat_last: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<Result<String>>) -> Self {
            ScriptedGenerator {
                responses: Mutex::new(responses.into()),
                repeat_last: None,
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn always(raw: &str) -> Self {
            ScriptedGenerator {
                responses: Mutex::new(VecDeque::new()),
                repeat_last: Some(raw.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn complete(&self, messages: &[Message]) -> Result<String> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.prompts.lock().unwrap().push(last);
            if let Some(next) = self.responses.lock().unwrap().pop_front() {
                return next;
            }
            self.repeat_last
                .clone()
                .ok_or_else(|| anyhow!("script exhausted"))
        }
    }

    struct SlowGenerator;

    #[async_trait]
    impl TextGenerator for SlowGenerator {
        async fn complete(&self, _messages: &[Message]) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("[]".to_string())
        }
    }

    fn valid_prompts(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("主体：产品实拍{i}；场景：客厅桌面；光线：自然窗光；风格：氛围感"))
            .collect()
    }

    fn fallback() -> Vec<String> {
        vec!["fallback".to_string()]
    }

    fn request(prompt: &str) -> GenerationRequest<'_> {
        GenerationRequest {
            system: None,
            prompt,
            images: &[],
        }
    }

    async fn run_prompts(gen: &dyn TextGenerator, policy: RetryPolicy) -> GenerationOutcome<Vec<String>> {
        let limits = ImagePromptLimits::default();
        generate_validated(
            gen,
            &request("生成6条提示词"),
            policy,
            |raw| parse_image_prompts(raw, &limits),
            fallback(),
        )
        .await
    }

    #[tokio::test]
    async fn test_malformed_output_exhausts_attempts_then_falls_back() {
        let gen = ScriptedGenerator::always("抱歉，我无法输出 JSON");
        let out = run_prompts(&gen, RetryPolicy::default()).await;
        assert_eq!(gen.calls(), 3);
        assert_eq!(out.attempts, 3);
        assert!(out.degraded);
        assert_eq!(out.value, fallback());
        assert_eq!(out.failures, vec!["解析失败".to_string()]);
    }

    #[tokio::test]
    async fn test_valid_output_returns_on_first_attempt() {
        let prompts = valid_prompts(6);
        let gen = ScriptedGenerator::always(&serde_json::to_string(&prompts).unwrap());
        let out = run_prompts(&gen, RetryPolicy::default()).await;
        assert_eq!(gen.calls(), 1);
        assert_eq!(out.attempts, 1);
        assert!(!out.degraded);
        assert_eq!(out.value, prompts);
    }

    #[tokio::test]
    async fn test_wrong_count_then_valid_takes_two_attempts() {
        let good = serde_json::to_string(&valid_prompts(6)).unwrap();
        let gen = ScriptedGenerator::new(vec![
            Ok(r#"["a","b","c","d","e"]"#.to_string()),
            Ok(good),
        ]);
        let out = run_prompts(&gen, RetryPolicy::default()).await;
        assert_eq!(out.attempts, 2);
        assert_eq!(out.value, valid_prompts(6));

        let prompts = gen.prompts.lock().unwrap();
        assert_eq!(prompts[0], "生成6条提示词");
        assert!(prompts[1].starts_with("生成6条提示词"));
        assert!(prompts[1].contains("数量不等于6(当前5)"), "{}", prompts[1]);
        assert!(prompts[1].contains("第1条:长度不合规(1)"));
    }

    #[tokio::test]
    async fn test_vendor_error_consumes_an_attempt() {
        let good = serde_json::to_string(&valid_prompts(6)).unwrap();
        let gen = ScriptedGenerator::new(vec![Err(anyhow!("HTTP 502")), Ok(good)]);
        let out = run_prompts(&gen, RetryPolicy::default()).await;
        assert_eq!(out.attempts, 2);
        assert!(gen.prompts.lock().unwrap()[1].contains("HTTP 502"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let policy = RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Some(Duration::from_millis(20)),
        };
        let out = run_prompts(&SlowGenerator, policy).await;
        assert!(out.degraded);
        assert_eq!(out.attempts, 2);
        assert!(out.failures[0].contains("超时"));
    }

    #[test]
    fn test_image_prompt_bounds_are_inclusive() {
        let limits = ImagePromptLimits {
            count: 2,
            min_chars: 3,
            max_chars: 5,
        };
        let ok = vec!["一二三".to_string(), "一二三四五".to_string()];
        assert!(validate_image_prompts(&ok, &limits).is_empty());
        let bad = vec!["一二".to_string(), "一二三四五六".to_string()];
        assert_eq!(validate_image_prompts(&bad, &limits).len(), 2);
    }

    fn copy_json(title_a: &str, title_b: &str, tags: &str) -> String {
        let body = "真的很好用，".repeat(20);
        format!(
            r#"{{"options":[{{"title":"{title_a}","body":"{body}\n\n第二段","tags":{tags}}},{{"title":"{title_b}","body":"{body}","tags":{tags}}}]}}"#
        )
    }

    #[test]
    fn test_parse_copy_options_happy_path() {
        let raw = copy_json("终于找到这个宝藏好物✨", "谁懂啊每天都被治愈💕", r##"["#好物","性价比","种草"]"##);
        let opts = parse_copy_options(&raw, &CopyLimits::default()).unwrap();
        assert_eq!(opts.len(), 2);
        assert_eq!(opts[0].tags, vec!["好物", "性价比", "种草"]);
        assert!(opts[0].body.contains("\n\n第二段"));
    }

    #[test]
    fn test_parse_copy_options_aliases() {
        let body = "这是一段足够长的正文。".repeat(12);
        let raw = format!(
            r#"好的，没问题！[{{"Title":"第一篇的好标题🔥","content":"{body}","tags":"实用，好物、种草"}},{{"title":"第二篇的好标题💕","Body":"{body}\\n结尾","Tags":["a","b","c"]}}]"#
        );
        let opts = parse_copy_options(&raw, &CopyLimits::default()).unwrap();
        assert_eq!(opts[0].tags, vec!["实用", "好物", "种草"]);
        assert!(opts[1].body.ends_with("\n结尾"));
    }

    #[test]
    fn test_identical_options_are_rejected() {
        let raw = copy_json("一模一样的标题✨", "一模一样的标题✨", r#"["a","b","c"]"#);
        let errs = parse_copy_options(&raw, &CopyLimits::default()).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("重复")));
    }

    #[test]
    fn test_copy_limits_report_each_violation() {
        let raw = r#"{"options":[{"title":"短","body":"太短","tags":[]}]}"#;
        let errs = parse_copy_options(raw, &CopyLimits::default()).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("数量不等于2")));
        assert!(errs.iter().any(|e| e.contains("标题长度")));
        assert!(errs.iter().any(|e| e.contains("Emoji")));
        assert!(errs.iter().any(|e| e.contains("正文长度")));
        assert!(errs.iter().any(|e| e.contains("标签数量")));
        assert_eq!(count_emoji("✨💯 ok"), 2);
    }
}
