use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/**
 * \brief 凭证服务的能力类型。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    /** \brief 文本生成（文案、提示词） */
    Text,
    /** \brief 图片生成/编辑 */
    Image,
    /** \brief 商品抠图 */
    Imageseg,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::Text => "text",
            CredentialType::Image => "image",
            CredentialType::Imageseg => "imageseg",
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "text" => Ok(CredentialType::Text),
            "image" => Ok(CredentialType::Image),
            "imageseg" => Ok(CredentialType::Imageseg),
            other => Err(format!("type 必须为 text/image/imageseg，收到 {other}")),
        }
    }
}

/**
 * \brief 凭证存储中的一条记录（仅保存密文）。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    /** \brief 记录 ID（UUID 字符串） */
    pub id: String,
    /** \brief 能力类型 */
    #[serde(rename = "type")]
    pub kind: CredentialType,
    /** \brief 厂商标识，如 volc/dashscope/google/aliyun-imageseg */
    pub vendor: String,
    /** \brief profile 名称，如 default/primary/backup */
    pub profile: String,
    /** \brief 可选的 baseURL 覆盖 */
    #[serde(default, rename = "baseURL", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /** \brief 加密后的密钥（text/image 为 API Key；imageseg 为 AK/SK JSON） */
    pub secret_enc: String,
    pub created_at: String,
    pub updated_at: String,
}

impl CredentialRecord {
    /** \brief 判断是否与 (type, vendor, profile) 同一身份。 */
    pub fn same_identity(&self, kind: CredentialType, vendor: &str, profile: &str) -> bool {
        self.kind == kind && self.vendor == vendor && self.profile == profile
    }
}

/**
 * \brief 凭证写入请求（明文，仅在写路径上出现）。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: CredentialType,
    pub vendor: String,
    pub profile: String,
    #[serde(default, rename = "baseURL")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub access_key_secret: Option<String>,
}

/**
 * \brief 凭证列表的脱敏视图。
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialView {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CredentialType,
    pub vendor: String,
    pub profile: String,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub secret_preview: String,
    pub updated_at: String,
}

/**
 * \brief 阿里云 AK/SK 凭证对。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKeyPair {
    pub access_key_id: String,
    pub access_key_secret: String,
}

/**
 * \brief 解析后的 API Key 及可选 baseURL。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub api_key: String,
    pub base_url: Option<String>,
}

/**
 * \brief 解析后的 AK/SK 凭证及可选 baseURL。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccessKey {
    pub pair: AccessKeyPair,
    pub base_url: Option<String>,
}

/**
 * \brief 供应商预设（Provider Registry 条目）。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPreset {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CredentialType,
    pub name: String,
    pub vendor: String,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    #[serde(default)]
    pub default_model: String,
    pub cred_profile: String,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief 供应商预设写入请求。
 */
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<CredentialType>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default, rename = "baseURL")]
    pub base_url: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub cred_profile: Option<String>,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 文本内容 */
    pub content: String,
    /** \brief 附带图片（data URI 或 URL），仅 user 消息使用 */
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: "system".to_string(),
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: "user".to_string(),
            content: content.into(),
            images: Vec::new(),
        }
    }
}

/**
 * \brief 一篇文案。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOption {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
}

/**
 * \brief 用户上传的参考图。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefImage {
    pub data_url: String,
    #[serde(default)]
    pub note: Option<String>,
}
