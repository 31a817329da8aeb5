use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::error::{StudioError, StudioResult};

static VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(copy|productName|description)\}\}").expect("template var regex"));

/** \brief 可选变量缺失时的替换文本。 */
pub const MISSING_VALUE: &str = "未提供";

pub const DEFAULT_IMAGE_PROMPT_TEMPLATE: &str =
    "你是小红书爆款配图生成助手。请基于输入内容生成6条提示词，严格JSON数组输出。输入：{{copy}}";

pub const IMAGE_PROMPT_FORMAT_HINT: &str = "\n\n输出要求：\n\
- 只输出 JSON 数组字符串（不要 Markdown/不要解释）。\n\
- 数组长度必须为6。\n\
- 每条尽量包含：主体/场景/光线/风格/核心元素（但不要为了格式牺牲自然度）。\n";

pub const DEFAULT_COPY_TEMPLATE: &str = "## 产品信息\n\
**产品名称**：{{productName}}\n\
**产品卖点**：{{description}}\n\n\
## 生成要求\n\
请根据以上产品信息，生成 2 篇完全不同的小红书爆款文案。\n\
- 第一篇偏理性分析：强调效果、性价比、实用性，正文用数据对比和使用体验。\n\
- 第二篇偏感性种草：强调场景、情感、品质感，正文用情感共鸣和生活分享。\n\
- 标题带 2-4 个 Emoji，15-30 字；正文 200-500 字，分段清晰，口语化；标签 5-10 个，不带 #。\n";

pub const COPY_SYSTEM_PROMPT: &str = "你是小红书爆款文案专家，深谙小红书平台的文案风格和用户喜好。\
你必须只返回一个有效的 JSON 对象，不要任何 Markdown 格式、不要任何解释文字、不要代码块标记。\n\
返回格式必须是：\n\
{\"options\":[{\"title\":\"标题1（带Emoji）\",\"body\":\"正文\",\"tags\":[\"标签1\",\"标签2\"]},\
{\"title\":\"标题2（带Emoji，完全不同角度）\",\"body\":\"正文\",\"tags\":[\"标签1\",\"标签2\"]}]}";

const WITH_IMAGE_HINT: &str =
    "\n**已提供参考图**：请结合图片理解产品外观、使用场景、细节特点，在文案中体现出来。\n";
const WITHOUT_IMAGE_HINT: &str =
    "\n**未提供参考图**：请仅基于文字信息生成，可以适当发挥想象，但要符合产品特点。\n";

/**
 * \brief 模板变量；copy 为必填（模板引用时），其余缺失时替换为固定文本。
 */
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateVars<'a> {
    pub copy: Option<&'a str>,
    pub product_name: Option<&'a str>,
    pub description: Option<&'a str>,
}

fn present(v: Option<&str>) -> Option<&str> {
    v.filter(|s| !s.trim().is_empty())
}

/**
 * \brief 渲染模板：`{{name}}` 全局字面替换，不做转义、嵌套或条件。
 * \return 模板引用了 `{{copy}}` 但未提供时返回 Template 错误。
 */
pub fn render(template: &str, vars: &TemplateVars<'_>) -> StudioResult<String> {
    let copy = if template.contains("{{copy}}") {
        present(vars.copy).ok_or_else(|| StudioError::Template("缺少必填变量 {{copy}}".to_string()))?
    } else {
        ""
    };
    let product_name = present(vars.product_name).unwrap_or(MISSING_VALUE);
    let description = present(vars.description).unwrap_or(MISSING_VALUE);
    // 单遍扫描原模板，替换进来的值不会再被展开
    let out = VAR_RE.replace_all(template, |caps: &Captures<'_>| match &caps[1] {
        "copy" => copy,
        "productName" => product_name,
        _ => description,
    });
    Ok(out.into_owned())
}

/**
 * \brief 生成配图提示词请求文本；配置模板优先，追加输出格式约束。
 */
pub fn image_prompt_request(configured: Option<&str>, copy: &str) -> StudioResult<String> {
    let template = configured.unwrap_or(DEFAULT_IMAGE_PROMPT_TEMPLATE);
    let vars = TemplateVars {
        copy: Some(copy),
        ..Default::default()
    };
    Ok(render(template, &vars)? + IMAGE_PROMPT_FORMAT_HINT)
}

/**
 * \brief 生成文案请求文本。
 */
pub fn copy_request(
    configured: Option<&str>,
    product_name: &str,
    description: &str,
    has_image: bool,
) -> StudioResult<String> {
    let template = configured.unwrap_or(DEFAULT_COPY_TEMPLATE);
    let vars = TemplateVars {
        copy: None,
        product_name: Some(product_name),
        description: Some(description),
    };
    let hint = if has_image { WITH_IMAGE_HINT } else { WITHOUT_IMAGE_HINT };
    Ok(render(template, &vars)? + hint + "\n只返回 JSON，不要其他任何内容。")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_all_variables() {
        let vars = TemplateVars {
            copy: Some("Best mug ever"),
            product_name: Some("Mug"),
            description: None,
        };
        let out = render("Product: {{productName}}. Copy: {{copy}}", &vars).unwrap();
        assert_eq!(out, "Product: Mug. Copy: Best mug ever");
    }

    #[test]
    fn test_render_is_global_and_literal() {
        let vars = TemplateVars {
            copy: Some("$1 {{x}}"),
            ..Default::default()
        };
        let out = render("{{copy}}|{{copy}}|{{unknown}}", &vars).unwrap();
        assert_eq!(out, "$1 {{x}}|$1 {{x}}|{{unknown}}");
    }

    #[test]
    fn test_inserted_values_are_not_expanded_again() {
        let vars = TemplateVars {
            copy: Some("写给{{description}}的人，{{productName}}"),
            product_name: Some("Mug"),
            description: Some("保温"),
        };
        let out = render("{{copy}}|{{productName}}|{{description}}", &vars).unwrap();
        assert_eq!(out, "写给{{description}}的人，{{productName}}|Mug|保温");

        let vars = TemplateVars {
            product_name: Some("{{description}}"),
            description: Some("d"),
            ..Default::default()
        };
        assert_eq!(render("{{productName}}/{{description}}", &vars).unwrap(), "{{description}}/d");
    }

    #[test]
    fn test_missing_optional_uses_fallback_text() {
        let out = render("[{{productName}}][{{description}}]", &TemplateVars::default()).unwrap();
        assert_eq!(out, format!("[{MISSING_VALUE}][{MISSING_VALUE}]"));
    }

    #[test]
    fn test_missing_copy_is_an_error() {
        let err = render("输入：{{copy}}", &TemplateVars::default()).unwrap_err();
        assert!(matches!(err, StudioError::Template(_)));
        let blank = TemplateVars {
            copy: Some("   "),
            ..Default::default()
        };
        assert!(render("{{copy}}", &blank).is_err());
        // 未引用 copy 的模板不要求提供
        assert_eq!(render("plain", &TemplateVars::default()).unwrap(), "plain");
    }

    #[test]
    fn test_configured_template_overrides_default() {
        let out = image_prompt_request(Some("自定义：{{copy}}"), "文案").unwrap();
        assert!(out.starts_with("自定义：文案"));
        assert!(out.ends_with(IMAGE_PROMPT_FORMAT_HINT));

        let out = image_prompt_request(None, "文案").unwrap();
        assert!(out.contains("输入：文案"));

        let copy = copy_request(None, "保温杯", "24小时保温", true).unwrap();
        assert!(copy.contains("保温杯") && copy.contains("24小时保温"));
        assert!(copy.contains("已提供参考图"));
    }
}
