//! 凭证存储：全部记录序列化为一个 JSON 数组，保存在 `API_CREDENTIALS_JSON` 配置键下。
//!
//! 每次写入都是整表读-改-写，并发写入以最后一次为准。该存储只服务于低并发的后台管理，
//! 如需多管理员并发写入，应改为逐条记录存储并加乐观锁。

use anyhow::Result;
use rusqlite::Connection;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::crypto::{mask_secret, SecretCodec};
use crate::db;
use crate::error::{StudioError, StudioResult};
use crate::models::{
    AccessKeyPair, CredentialInput, CredentialRecord, CredentialType, CredentialView,
};

pub const CREDENTIALS_KEY: &str = "API_CREDENTIALS_JSON";
const CREDENTIALS_DESCRIPTION: &str = "API管理中心：凭证 profiles（加密存储）";

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/**
 * \brief 读取全部凭证记录；配置缺失或 JSON 损坏时返回空列表。
 */
pub fn list(conn: &Connection) -> Result<Vec<CredentialRecord>> {
    let raw = db::get_config(conn, CREDENTIALS_KEY)?;
    Ok(raw
        .and_then(|s| serde_json::from_str::<Vec<CredentialRecord>>(&s).ok())
        .unwrap_or_default())
}

fn save_list(conn: &Connection, list: &[CredentialRecord]) -> Result<()> {
    let json = serde_json::to_string(list)?;
    db::set_config_with_description(conn, CREDENTIALS_KEY, &json, Some(CREDENTIALS_DESCRIPTION))
}

/**
 * \brief 按 (type, vendor, profile) 精确查找。
 */
pub fn find(
    conn: &Connection,
    kind: CredentialType,
    vendor: &str,
    profile: &str,
) -> Result<Option<CredentialRecord>> {
    Ok(list(conn)?
        .into_iter()
        .find(|c| c.same_identity(kind, vendor, profile)))
}

/**
 * \brief 校验写入请求并生成待加密的明文。
 */
fn secret_plaintext(input: &CredentialInput) -> StudioResult<String> {
    match input.kind {
        CredentialType::Imageseg => {
            let id = input.access_key_id.as_deref().map(str::trim).unwrap_or("");
            let secret = input
                .access_key_secret
                .as_deref()
                .map(str::trim)
                .unwrap_or("");
            if id.is_empty() || secret.is_empty() {
                return Err(StudioError::InvalidInput(
                    "imageseg 需要 accessKeyId/accessKeySecret".to_string(),
                ));
            }
            let pair = AccessKeyPair {
                access_key_id: id.to_string(),
                access_key_secret: secret.to_string(),
            };
            serde_json::to_string(&pair).map_err(|e| StudioError::Storage(e.into()))
        }
        CredentialType::Text | CredentialType::Image => {
            let key = input.api_key.as_deref().map(str::trim).unwrap_or("");
            if key.is_empty() {
                return Err(StudioError::InvalidInput("需要 apiKey".to_string()));
            }
            Ok(key.to_string())
        }
    }
}

/**
 * \brief 保存凭证：同 (type, vendor, profile) 的旧记录会被替换，与 id 无关。
 * \details 显式传入的 id 会被保留，否则生成新 id；新记录置于列表首位。
 */
pub fn upsert(
    conn: &Connection,
    codec: &SecretCodec,
    input: &CredentialInput,
) -> StudioResult<CredentialRecord> {
    let vendor = input.vendor.trim();
    let profile = input.profile.trim();
    if vendor.is_empty() {
        return Err(StudioError::InvalidInput("vendor 不能为空".to_string()));
    }
    if profile.is_empty() {
        return Err(StudioError::InvalidInput("profile 不能为空".to_string()));
    }
    let plain = secret_plaintext(input)?;

    let now = now_rfc3339();
    let existing = list(conn)?;
    let id = input
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let created_at = existing
        .iter()
        .find(|c| c.id == id)
        .map(|c| c.created_at.clone())
        .unwrap_or_else(|| now.clone());

    let record = CredentialRecord {
        id: id.clone(),
        kind: input.kind,
        vendor: vendor.to_string(),
        profile: profile.to_string(),
        base_url: input
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        secret_enc: codec.encrypt(&plain)?,
        created_at,
        updated_at: now,
    };

    let mut next: Vec<CredentialRecord> = existing
        .into_iter()
        .filter(|c| c.id != id && !c.same_identity(record.kind, &record.vendor, &record.profile))
        .collect();
    next.insert(0, record.clone());
    save_list(conn, &next)?;
    Ok(record)
}

/**
 * \brief 按 id 删除，返回是否删除了记录。
 */
pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let existing = list(conn)?;
    let before = existing.len();
    let next: Vec<CredentialRecord> = existing.into_iter().filter(|c| c.id != id).collect();
    let removed = next.len() != before;
    if removed {
        save_list(conn, &next)?;
    }
    Ok(removed)
}

/**
 * \brief 生成脱敏预览；解密失败时返回提示文本而非报错。
 */
pub fn preview(codec: &SecretCodec, record: &CredentialRecord) -> String {
    let plain = match codec.decrypt(&record.secret_enc) {
        Ok(p) => p,
        Err(_) => return "(decrypt failed)".to_string(),
    };
    match record.kind {
        CredentialType::Imageseg => match serde_json::from_str::<serde_json::Value>(&plain) {
            Ok(v) => {
                let id = v.get("accessKeyId").and_then(|x| x.as_str()).unwrap_or("");
                let secret = v
                    .get("accessKeySecret")
                    .and_then(|x| x.as_str())
                    .unwrap_or("");
                format!("{} / {}", mask_secret(id), mask_secret(secret))
            }
            Err(_) => "(decrypt failed)".to_string(),
        },
        _ => mask_secret(&plain),
    }
}

/**
 * \brief 列出脱敏视图，供后台展示。
 */
pub fn list_views(conn: &Connection, codec: &SecretCodec) -> Result<Vec<CredentialView>> {
    Ok(list(conn)?
        .into_iter()
        .map(|c| CredentialView {
            secret_preview: preview(codec, &c),
            id: c.id,
            kind: c.kind,
            vendor: c.vendor,
            profile: c.profile,
            base_url: c.base_url.unwrap_or_default(),
            updated_at: c.updated_at,
        })
        .collect())
}
