//! 供应商预设（Provider Registry），存储格式与凭证相同：`API_PROVIDERS_JSON` 下的 JSON 数组。

use anyhow::Result;
use rusqlite::Connection;
use uuid::Uuid;

use crate::credentials::now_rfc3339;
use crate::db;
use crate::error::{StudioError, StudioResult};
use crate::models::{CredentialType, ProviderInput, ProviderPreset};

pub const PROVIDERS_KEY: &str = "API_PROVIDERS_JSON";
const PROVIDERS_DESCRIPTION: &str = "供应商API配置（Provider Registry）";

/**
 * \brief 读取全部预设；损坏的 JSON 视为空表。
 */
pub fn list(conn: &Connection) -> Result<Vec<ProviderPreset>> {
    let raw = db::get_config(conn, PROVIDERS_KEY)?;
    Ok(raw
        .and_then(|s| serde_json::from_str::<Vec<ProviderPreset>>(&s).ok())
        .unwrap_or_default())
}

fn save_list(conn: &Connection, list: &[ProviderPreset]) -> Result<()> {
    let json = serde_json::to_string(list)?;
    db::set_config_with_description(conn, PROVIDERS_KEY, &json, Some(PROVIDERS_DESCRIPTION))
}

fn required<'a>(value: &'a str, field: &str) -> StudioResult<&'a str> {
    let v = value.trim();
    if v.is_empty() {
        return Err(StudioError::InvalidInput(format!("{field} 不能为空")));
    }
    Ok(v)
}

/**
 * \brief 按 id 新增或更新预设，结果置于列表首位。
 */
pub fn upsert(conn: &Connection, input: &ProviderInput) -> StudioResult<ProviderPreset> {
    let kind = input.kind.ok_or_else(|| {
        StudioError::InvalidInput("type 不能为空，且必须为 text/image/imageseg".to_string())
    })?;
    let name = required(&input.name, "name")?;
    let vendor = required(&input.vendor, "vendor")?;
    let base_url = required(&input.base_url, "baseURL")?;

    let now = now_rfc3339();
    let existing = list(conn)?;
    let explicit_id = input
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let id = explicit_id
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let created_at = explicit_id
        .and_then(|id| existing.iter().find(|p| p.id == id))
        .map(|p| p.created_at.clone())
        .unwrap_or_else(|| now.clone());

    let preset = ProviderPreset {
        id: id.clone(),
        kind,
        name: name.to_string(),
        vendor: vendor.to_string(),
        base_url: base_url.to_string(),
        default_model: input
            .default_model
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .to_string(),
        cred_profile: input
            .cred_profile
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("default")
            .to_string(),
        created_at,
        updated_at: now,
    };

    let mut next: Vec<ProviderPreset> = existing.into_iter().filter(|p| p.id != id).collect();
    next.insert(0, preset.clone());
    save_list(conn, &next)?;
    Ok(preset)
}

pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let existing = list(conn)?;
    let before = existing.len();
    let next: Vec<ProviderPreset> = existing.into_iter().filter(|p| p.id != id).collect();
    let removed = next.len() != before;
    if removed {
        save_list(conn, &next)?;
    }
    Ok(removed)
}

/**
 * \brief 将预设写入对应能力的引擎配置键。
 * \details 预设未填默认模型时清除已配置的模型，改用厂商默认值。
 */
pub fn apply(conn: &Connection, id: &str) -> StudioResult<ProviderPreset> {
    let preset = list(conn)?
        .into_iter()
        .find(|p| p.id == id)
        .ok_or_else(|| StudioError::NotFound(format!("provider {id}")))?;

    let prefix = match preset.kind {
        CredentialType::Text => "COPY_ENGINE",
        CredentialType::Image => "IMAGE_ENGINE",
        CredentialType::Imageseg => "IMAGESEG",
    };
    db::set_config(conn, &format!("{prefix}_VENDOR"), &preset.vendor)?;
    db::set_config(conn, &format!("{prefix}_CRED_PROFILE"), &preset.cred_profile)?;
    if preset.kind != CredentialType::Imageseg {
        db::set_config(conn, &format!("{prefix}_BASE_URL"), &preset.base_url)?;
        let model_key = format!("{prefix}_MODEL_ID");
        if preset.default_model.is_empty() {
            db::delete_config(conn, &model_key)?;
        } else {
            db::set_config(conn, &model_key, &preset.default_model)?;
        }
    }
    tracing::info!(id = %preset.id, kind = %preset.kind, vendor = %preset.vendor, "provider preset applied");
    Ok(preset)
}
