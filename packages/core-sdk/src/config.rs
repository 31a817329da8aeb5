use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::Result;
use rusqlite::Connection;

use crate::db;
use crate::models::{CopyOption, CredentialType};

pub const DEFAULT_TEXT_VENDOR: &str = "volc";
pub const DEFAULT_IMAGE_VENDOR: &str = "dashscope";
pub const DEFAULT_IMAGESEG_VENDOR: &str = "aliyun-imageseg";
pub const DEFAULT_PROFILE: &str = "default";

const VOLC_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3";
const VOLC_MODEL: &str = "doubao-seed-1-6-lite-251015";
const DASHSCOPE_BASE_URL: &str = "https://dashscope.aliyuncs.com/api/v1";
const DASHSCOPE_MODEL: &str = "qwen-image-edit-plus";
const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GOOGLE_TEXT_MODEL: &str = "gemini-1.5-pro-latest";
const GOOGLE_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

pub const FALLBACK_IMAGE_PROMPTS_KEY: &str = "FALLBACK_IMAGE_PROMPTS_JSON";
pub const FALLBACK_COPY_OPTIONS_KEY: &str = "FALLBACK_COPY_OPTIONS_JSON";

/**
 * \brief 环境变量来源；生产使用进程环境，测试使用内存表。
 */
pub trait EnvSource: Send + Sync {
    /** \brief 读取非空变量值。 */
    fn var(&self, key: &str) -> Option<String>;
    /** \brief 列出全部变量名，用于 profile 扫描。 */
    fn keys(&self) -> Vec<String>;
}

/** \brief 进程环境变量。 */
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }

    fn keys(&self) -> Vec<String> {
        std::env::vars().map(|(k, _)| k).collect()
    }
}

/** \brief 内存环境表。 */
#[derive(Debug, Clone, Default)]
pub struct MapEnv(HashMap<String, String>);

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }
}

impl EnvSource for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.0.get(key).filter(|v| !v.trim().is_empty()).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }
}

/**
 * \brief 进程级设置，启动时从环境读取一次。
 */
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub db_path: PathBuf,
    pub addr: String,
    /** \brief 临时图床对外可访问的基地址 */
    pub public_base_url: String,
    pub production: bool,
    pub vendor_timeout: Duration,
    pub log_file: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            db_path: PathBuf::from("notecraft.db"),
            addr: "127.0.0.1:3000".to_string(),
            public_base_url: "http://127.0.0.1:3000".to_string(),
            production: false,
            vendor_timeout: Duration::from_secs(90),
            log_file: false,
        }
    }
}

impl AppSettings {
    pub fn from_env() -> Self {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source(env: &dyn EnvSource) -> Self {
        let defaults = AppSettings::default();
        let addr = env.var("NOTECRAFT_ADDR").unwrap_or(defaults.addr);
        let public_base_url = env
            .var("NOTECRAFT_PUBLIC_BASE_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://{addr}"));
        let production = env
            .var("NOTECRAFT_ENV")
            .or_else(|| env.var("APP_ENV"))
            .map(|v| v.trim().eq_ignore_ascii_case("production"))
            .unwrap_or(false);
        let vendor_timeout = env
            .var("VENDOR_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.vendor_timeout);
        AppSettings {
            db_path: env
                .var("NOTECRAFT_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            addr,
            public_base_url,
            production,
            vendor_timeout,
            log_file: env
                .var("NOTECRAFT_LOG_FILE")
                .map(|v| db::parse_bool(&v))
                .unwrap_or(false),
        }
    }
}

fn config_or(conn: &Connection, key: &str, default: &str) -> Result<String> {
    Ok(db::get_config_nonempty(conn, key)?.unwrap_or_else(|| default.to_string()))
}

/**
 * \brief 文案引擎配置（COPY_ENGINE_*）。
 */
#[derive(Debug, Clone)]
pub struct TextEngineConfig {
    pub enabled: bool,
    pub vendor: String,
    pub profile: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub copy_template: Option<String>,
    pub image_prompt_template: Option<String>,
}

impl TextEngineConfig {
    pub fn load(conn: &Connection) -> Result<Self> {
        Ok(TextEngineConfig {
            enabled: db::get_bool_config(conn, "COPY_ENGINE_ENABLED", true)?,
            vendor: config_or(conn, "COPY_ENGINE_VENDOR", DEFAULT_TEXT_VENDOR)?,
            profile: config_or(conn, "COPY_ENGINE_CRED_PROFILE", DEFAULT_PROFILE)?,
            base_url: db::get_config_nonempty(conn, "COPY_ENGINE_BASE_URL")?,
            model: db::get_config_nonempty(conn, "COPY_ENGINE_MODEL_ID")?,
            temperature: db::get_config_nonempty(conn, "COPY_ENGINE_TEMPERATURE")?
                .and_then(|v| v.parse::<f32>().ok())
                .filter(|t| t.is_finite())
                .unwrap_or(0.9),
            max_tokens: db::get_config_nonempty(conn, "COPY_ENGINE_MAX_TOKENS")?
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(4096),
            copy_template: db::get_config_nonempty(conn, "XHS_COPY_PROMPT_TEMPLATE")?,
            image_prompt_template: db::get_config_nonempty(conn, "XHS_IMAGE_PROMPT_TEMPLATE")?,
        })
    }

    /**
     * \brief 模型 ID：配置 > AI_MODEL_NAME > 厂商默认。
     */
    pub fn model_or_default(&self, env: &dyn EnvSource) -> String {
        self.model
            .clone()
            .or_else(|| env.var("AI_MODEL_NAME"))
            .unwrap_or_else(|| match self.vendor.as_str() {
                "google" => GOOGLE_TEXT_MODEL.to_string(),
                _ => VOLC_MODEL.to_string(),
            })
    }
}

/**
 * \brief 配图引擎配置（IMAGE_ENGINE_*）。
 */
#[derive(Debug, Clone)]
pub struct ImageEngineConfig {
    pub enabled: bool,
    pub vendor: String,
    pub profile: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub negative_prompt: Option<String>,
    pub prompt_extend: bool,
}

impl ImageEngineConfig {
    pub fn load(conn: &Connection) -> Result<Self> {
        Ok(ImageEngineConfig {
            enabled: db::get_bool_config(conn, "IMAGE_ENGINE_ENABLED", true)?,
            vendor: config_or(conn, "IMAGE_ENGINE_VENDOR", DEFAULT_IMAGE_VENDOR)?,
            profile: config_or(conn, "IMAGE_ENGINE_CRED_PROFILE", DEFAULT_PROFILE)?,
            base_url: db::get_config_nonempty(conn, "IMAGE_ENGINE_BASE_URL")?,
            model: db::get_config_nonempty(conn, "IMAGE_ENGINE_MODEL_ID")?,
            negative_prompt: db::get_config_nonempty(conn, "IMAGE_ENGINE_NEGATIVE_PROMPT")?,
            prompt_extend: db::get_bool_config(conn, "IMAGE_ENGINE_PROMPT_EXTEND", false)?,
        })
    }

    pub fn model_or_default(&self, env: &dyn EnvSource) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.vendor.as_str() {
            "google" => GOOGLE_IMAGE_MODEL.to_string(),
            _ => env
                .var("DASHSCOPE_MODEL")
                .unwrap_or_else(|| DASHSCOPE_MODEL.to_string()),
        }
    }
}

/**
 * \brief 抠图配置（IMAGESEG_*）。
 */
#[derive(Debug, Clone)]
pub struct ImagesegConfig {
    pub enabled: bool,
    pub vendor: String,
    pub profile: String,
}

impl ImagesegConfig {
    pub fn load(conn: &Connection) -> Result<Self> {
        Ok(ImagesegConfig {
            enabled: db::get_bool_config(conn, "IMAGESEG_ENABLED", true)?,
            vendor: config_or(conn, "IMAGESEG_VENDOR", DEFAULT_IMAGESEG_VENDOR)?,
            profile: config_or(conn, "IMAGESEG_CRED_PROFILE", DEFAULT_PROFILE)?,
        })
    }
}

fn vendor_base_url_env(kind: CredentialType, vendor: &str) -> &'static [&'static str] {
    match (kind, vendor) {
        (_, "google") => &["GOOGLE_BASE_URL"],
        (CredentialType::Text, _) => &["VOLC_BASE_URL", "AI_BASE_URL", "TEXT_BASE_URL"],
        (CredentialType::Image, _) => &["DASHSCOPE_BASE_URL", "IMAGE_BASE_URL"],
        (CredentialType::Imageseg, _) => &[],
    }
}

fn vendor_default_base_url(kind: CredentialType, vendor: &str) -> &'static str {
    match (kind, vendor) {
        (_, "google") => GOOGLE_BASE_URL,
        (CredentialType::Image, _) => DASHSCOPE_BASE_URL,
        _ => VOLC_BASE_URL,
    }
}

/**
 * \brief 计算最终 baseURL：引擎配置 > 凭证记录 > 厂商环境变量 > 内置默认。
 */
pub fn effective_base_url(
    configured: Option<&str>,
    credential: Option<&str>,
    kind: CredentialType,
    vendor: &str,
    env: &dyn EnvSource,
) -> String {
    let pick = configured
        .or(credential)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| {
            vendor_base_url_env(kind, vendor)
                .iter()
                .find_map(|key| env.var(key))
        })
        .unwrap_or_else(|| vendor_default_base_url(kind, vendor).to_string());
    pick.trim_end_matches('/').to_string()
}

/**
 * \brief 校验全部失败后的兜底结果。
 */
#[derive(Debug, Clone)]
pub struct FallbackPayloads {
    pub image_prompts: Vec<String>,
    pub copy_options: Vec<CopyOption>,
}

impl Default for FallbackPayloads {
    fn default() -> Self {
        FallbackPayloads {
            image_prompts: [
                "主体：产品实拍主体；场景：卧室/客厅桌面；光线：自然窗光；风格：氛围感；核心元素：绿植、咖啡杯、轻微噪点",
                "主体：产品卖点清单；场景：办公桌便签纸；光线：柔光；风格：干货清单；核心元素：3条要点、图标点缀",
                "主体：前后/好坏对比；场景：白色桌面分屏；光线：均匀自然光；风格：对比展示；核心元素：左右对照、箭头标注",
                "主体：真实情绪共鸣；场景：生活场景手持/收纳；光线：暖光；风格：生活感；核心元素：人物/手部、日常道具",
                "主体：细节特写；场景：盘子/台面；光线：侧逆光；风格：微距质感；核心元素：纹理、光泽、浅景深",
                "主体：符号化信息图；场景：简约背景；光线：明亮；风格：极简图标；核心元素：图标组合、数据符号",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            copy_options: vec![
                CopyOption {
                    title: "终于找到！这个好物真的绝了✨💯".to_string(),
                    body: "姐妹们，最近入手了一件让我惊喜的好物，用了一段时间来认真说说感受。\n\n\
                           先说结论：实用性很强，做工也在线，日常使用基本没有踩雷的地方。\
                           对比之前用过的几款同类产品，它在细节上的用心程度明显更高，性价比也很能打。\n\n\
                           使用体验：上手简单，不需要额外学习成本，放在家里或者带出门都很方便。\n\n\
                           适合人群：追求品质又在意预算的朋友，可以放心冲～"
                        .to_string(),
                    tags: ["好物推荐", "性价比", "实用好物", "真实测评", "购物分享"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                },
                CopyOption {
                    title: "谁懂啊！用上它的每一天都很治愈💕🔥".to_string(),
                    body: "最近的小日子，因为它多了一点仪式感。\n\n\
                           早上醒来阳光刚好，顺手用上它，整个人的心情都被点亮了。\
                           那种被好好照顾的感觉，真的只有用过的人才懂。\n\n\
                           它不只是一件物品，更像是生活里的小确幸，让平凡的日常也变得值得期待。\n\n\
                           如果你也想给自己一点温柔，真心推荐试试看～"
                        .to_string(),
                    tags: ["好物分享", "生活好物", "种草", "治愈系", "品质生活"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                },
            ],
        }
    }
}

impl FallbackPayloads {
    /**
     * \brief 读取兜底结果；配置项存在且可解析时覆盖内置值。
     */
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut out = FallbackPayloads::default();
        if let Some(raw) = db::get_config_nonempty(conn, FALLBACK_IMAGE_PROMPTS_KEY)? {
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(list) if !list.is_empty() => out.image_prompts = list,
                _ => tracing::warn!(key = FALLBACK_IMAGE_PROMPTS_KEY, "ignoring unparsable fallback"),
            }
        }
        if let Some(raw) = db::get_config_nonempty(conn, FALLBACK_COPY_OPTIONS_KEY)? {
            match serde_json::from_str::<Vec<CopyOption>>(&raw) {
                Ok(list) if !list.is_empty() => out.copy_options = list,
                _ => tracing::warn!(key = FALLBACK_COPY_OPTIONS_KEY, "ignoring unparsable fallback"),
            }
        }
        Ok(out)
    }
}
