//! 从模型输出中定位并解析 JSON：去掉代码块标记，贪婪匹配首尾括号，失败时做一次机械修复。

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```(?:json|JSON)?").expect("fence regex"));
static ARRAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[\s\S]*\]").expect("array regex"));
static OBJECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[\s\S]*\}").expect("object regex"));
static TRAILING_COMMA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([}\]])").expect("trailing comma regex"));

/**
 * \brief 去除 Markdown 代码块标记。
 */
pub fn strip_fences(text: &str) -> String {
    FENCE_RE.replace_all(text, "").trim().to_string()
}

/**
 * \brief 机械修复：删除尾随逗号，统一引号。
 */
pub fn repair(candidate: &str) -> String {
    let fixed = TRAILING_COMMA_RE.replace_all(candidate, "$1");
    let fixed = fixed.replace(['\u{201C}', '\u{201D}'], "\"");
    if fixed.contains('"') {
        fixed
    } else {
        fixed.replace(['\'', '\u{2018}', '\u{2019}'], "\"")
    }
}

fn parse_with_repair(candidate: &str) -> Option<Value> {
    serde_json::from_str::<Value>(candidate)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(&repair(candidate)).ok())
}

/**
 * \brief 从 `start` 处的开括号起做平衡扫描（忽略字符串内的括号）。
 */
fn balanced_slice(text: &str, start: usize, open: char, close: char) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_with(text: &str, re: &Regex, open: char, close: char) -> Option<Value> {
    let cleaned = strip_fences(text);
    if let Some(m) = re.find(&cleaned) {
        if let Some(v) = parse_with_repair(m.as_str()) {
            return Some(v);
        }
    }
    // 前面的候选（如 `[注]`）解析失败时继续尝试后面的开括号
    cleaned
        .match_indices(open)
        .filter_map(|(start, _)| balanced_slice(&cleaned, start, open, close))
        .find_map(parse_with_repair)
}

/**
 * \brief 提取 JSON 数组。
 */
pub fn extract_array(text: &str) -> Option<Vec<Value>> {
    match extract_with(text, &ARRAY_RE, '[', ']')? {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

/**
 * \brief 提取 JSON 对象。
 */
pub fn extract_object(text: &str) -> Option<Value> {
    extract_with(text, &OBJECT_RE, '{', '}').filter(Value::is_object)
}

/**
 * \brief 提取 JSON，对象或数组以先出现者为准。
 */
pub fn extract_any(text: &str) -> Option<Value> {
    let cleaned = strip_fences(text);
    let obj_at = cleaned.find('{');
    let arr_at = cleaned.find('[');
    let object_first = match (obj_at, arr_at) {
        (Some(o), Some(a)) => o < a,
        (Some(_), None) => true,
        _ => false,
    };
    if object_first {
        extract_object(&cleaned).or_else(|| extract_array(&cleaned).map(Value::Array))
    } else {
        extract_array(&cleaned)
            .map(Value::Array)
            .or_else(|| extract_object(&cleaned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_array() {
        let raw = "好的，以下是结果：\n```json\n[\"a\", \"b\"]\n```";
        let items = extract_array(raw).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], "a");
    }

    #[test]
    fn test_trailing_comma_and_single_quotes_repaired() {
        let items = extract_array("['一', '二',]").unwrap();
        assert_eq!(items, vec![Value::from("一"), Value::from("二")]);

        let obj = extract_object("{\"title\": \"x\", \"tags\": [\"t\",],}").unwrap();
        assert_eq!(obj["title"], "x");
    }

    #[test]
    fn test_balanced_scan_when_greedy_match_overreaches() {
        let items = extract_array("[\"ok\", \"fine\"] 注：[见说明]").unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_leading_bracketed_note_is_skipped() {
        let items = extract_array("[注]：[\"第一条\", \"第二条\"]").unwrap();
        assert_eq!(items, vec![Value::from("第一条"), Value::from("第二条")]);

        let obj = extract_object("{说明} 结果：{\"title\": \"x\"}").unwrap();
        assert_eq!(obj["title"], "x");
    }

    #[test]
    fn test_brackets_inside_strings_are_ignored() {
        let obj = extract_object("{\"body\": \"含 } 的正文\"} 附注 }").unwrap();
        assert_eq!(obj["body"], "含 } 的正文");
    }

    #[test]
    fn test_unrecoverable_returns_none() {
        assert!(extract_array("完全没有 JSON").is_none());
        assert!(extract_array("{\"not\": \"array\"}").is_none());
        assert!(extract_object("[1,2]").is_none());
    }

    #[test]
    fn test_extract_any_prefers_first_bracket() {
        let v = extract_any("{\"options\": [1]}").unwrap();
        assert!(v.is_object());
        let v = extract_any("[{\"title\": \"a\"}]").unwrap();
        assert!(v.is_array());
    }
}
