use thiserror::Error;

use crate::models::CredentialType;

/**
 * \brief SDK 统一错误类型。
 * \details 厂商调用内部使用 anyhow，跨模块边界时收敛为本枚举，便于 HTTP 层映射状态码。
 */
#[derive(Debug, Error)]
pub enum StudioError {
    /** \brief 指定 (type, vendor, profile) 未找到任何可用凭证。 */
    #[error("服务端未配置 {kind} 引擎密钥：请在“API管理中心”配置 vendor={vendor} profile={profile}，或设置环境变量")]
    MissingCredential {
        kind: CredentialType,
        vendor: String,
        profile: String,
    },

    /** \brief 凭证密文损坏或主密钥不匹配。 */
    #[error("credential unusable: {0}")]
    Decryption(String),

    /** \brief 模板渲染失败（必填占位符缺失）。 */
    #[error("template error: {0}")]
    Template(String),

    /** \brief 厂商接口调用失败。 */
    #[error("vendor call failed: {0}")]
    Vendor(String),

    /** \brief 引擎已在后台关闭。 */
    #[error("{0}")]
    Disabled(String),

    /** \brief 请求参数不合法。 */
    #[error("{0}")]
    InvalidInput(String),

    /** \brief 目标记录不存在。 */
    #[error("{0} not found")]
    NotFound(String),

    /** \brief 存储层错误。 */
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type StudioResult<T> = Result<T, StudioError>;

impl StudioError {
    pub fn missing_credential(kind: CredentialType, vendor: &str, profile: &str) -> Self {
        StudioError::MissingCredential {
            kind,
            vendor: vendor.to_string(),
            profile: profile.to_string(),
        }
    }
}
