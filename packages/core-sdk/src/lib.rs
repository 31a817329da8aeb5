pub mod config;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod error;
pub mod generation;
pub mod image;
pub mod imageseg;
pub mod json_extract;
pub mod llm;
pub mod models;
pub mod packaging;
pub mod providers;
pub mod resolver;
pub mod server;
pub mod telemetry;
pub mod template;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::{AppSettings, EnvSource, MapEnv, ProcessEnv};
    pub use crate::crypto::SecretCodec;
    pub use crate::db::{self, Db};
    pub use crate::error::{StudioError, StudioResult};
    pub use crate::models::{CredentialInput, CredentialType};
    pub use crate::resolver::CredentialResolver;
    pub use crate::server::{self, AppState};
    pub use crate::{credentials, telemetry};
}
