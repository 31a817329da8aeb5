//! 凭证解析：先查凭证存储，再按约定名读取环境变量，都没有时返回 None。

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::Serialize;

use crate::config::{EnvSource, DEFAULT_PROFILE};
use crate::credentials;
use crate::crypto::SecretCodec;
use crate::db::Db;
use crate::error::{StudioError, StudioResult};
use crate::models::{AccessKeyPair, CredentialType, ResolvedAccessKey, ResolvedKey};

/**
 * \brief 厂商名转环境变量前缀：大写，非字母数字替换为下划线。
 */
pub fn env_prefix(vendor: &str) -> String {
    vendor
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn legacy_key_aliases(vendor: &str) -> &'static [&'static str] {
    match vendor {
        "volc" => &["AI_API_KEY", "TEXT_API_KEY"],
        "dashscope" => &["IMAGE_API_KEY"],
        _ => &[],
    }
}

const AK_ID_VARS: [&str; 3] = [
    "ALIBABA_CLOUD_ACCESS_KEY_ID",
    "ALIYUN_ACCESS_KEY",
    "ALIYUN_ACCESS_KEY_ID",
];
const AK_SECRET_VARS: [&str; 3] = [
    "ALIBABA_CLOUD_ACCESS_KEY_SECRET",
    "ALIYUN_SECRET_KEY",
    "ALIYUN_ACCESS_KEY_SECRET",
];

/**
 * \brief 某厂商下各能力的 profile 名称（仅名称，不含密钥）。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VendorProfiles {
    pub text: BTreeSet<String>,
    pub image: BTreeSet<String>,
    pub imageseg: BTreeSet<String>,
}

impl VendorProfiles {
    fn slot(&mut self, kind: CredentialType) -> &mut BTreeSet<String> {
        match kind {
            CredentialType::Text => &mut self.text,
            CredentialType::Image => &mut self.image,
            CredentialType::Imageseg => &mut self.imageseg,
        }
    }
}

/**
 * \brief 凭证解析器：存储优先，环境变量兜底。
 */
#[derive(Clone)]
pub struct CredentialResolver {
    db: Db,
    codec: SecretCodec,
    env: Arc<dyn EnvSource>,
}

impl CredentialResolver {
    pub fn new(db: Db, codec: SecretCodec, env: Arc<dyn EnvSource>) -> Self {
        CredentialResolver { db, codec, env }
    }

    pub fn env(&self) -> &dyn EnvSource {
        self.env.as_ref()
    }

    pub fn codec(&self) -> &SecretCodec {
        &self.codec
    }

    /**
     * \brief 解析 API Key（text/image）。
     * \return 存储命中但解密失败时返回 Decryption 错误，不回退到环境变量。
     */
    pub fn resolve_api_key(
        &self,
        kind: CredentialType,
        vendor: &str,
        profile: &str,
    ) -> StudioResult<Option<ResolvedKey>> {
        if let Some(found) = self.from_store(kind, vendor, profile)? {
            return Ok(Some(found));
        }
        // google 文本引擎可复用同 profile 的配图凭证
        if kind == CredentialType::Text && vendor == "google" {
            if let Some(found) = self.from_store(CredentialType::Image, vendor, profile)? {
                return Ok(Some(found));
            }
        }
        Ok(self.api_key_from_env(vendor, profile).map(|api_key| ResolvedKey {
            api_key,
            base_url: None,
        }))
    }

    fn from_store(
        &self,
        kind: CredentialType,
        vendor: &str,
        profile: &str,
    ) -> StudioResult<Option<ResolvedKey>> {
        let record = {
            let conn = self.db.lock();
            credentials::find(&conn, kind, vendor, profile)?
        };
        let Some(record) = record else {
            return Ok(None);
        };
        let api_key = self.codec.decrypt(&record.secret_enc)?;
        Ok(Some(ResolvedKey {
            api_key,
            base_url: record
                .base_url
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }))
    }

    fn api_key_from_env(&self, vendor: &str, profile: &str) -> Option<String> {
        let prefix = env_prefix(vendor);
        if prefix.is_empty() {
            return None;
        }
        if profile != DEFAULT_PROFILE {
            if let Some(v) = self.env.var(&format!("{prefix}_API_KEY_{profile}")) {
                return Some(v);
            }
        }
        self.env.var(&format!("{prefix}_API_KEY")).or_else(|| {
            legacy_key_aliases(vendor)
                .iter()
                .find_map(|k| self.env.var(k))
        })
    }

    /**
     * \brief 解析 AK/SK（imageseg）；记录缺任一字段时视为未找到。
     */
    pub fn resolve_access_key(
        &self,
        vendor: &str,
        profile: &str,
    ) -> StudioResult<Option<ResolvedAccessKey>> {
        let record = {
            let conn = self.db.lock();
            credentials::find(&conn, CredentialType::Imageseg, vendor, profile)?
        };
        if let Some(record) = record {
            let plain = self.codec.decrypt(&record.secret_enc)?;
            match serde_json::from_str::<AccessKeyPair>(&plain) {
                Ok(pair)
                    if !pair.access_key_id.trim().is_empty()
                        && !pair.access_key_secret.trim().is_empty() =>
                {
                    return Ok(Some(ResolvedAccessKey {
                        pair,
                        base_url: record.base_url.filter(|s| !s.trim().is_empty()),
                    }));
                }
                _ => tracing::warn!(vendor, profile, "imageseg credential incomplete, ignoring"),
            }
        }
        Ok(self.access_key_from_env(profile))
    }

    fn access_key_from_env(&self, profile: &str) -> Option<ResolvedAccessKey> {
        let lookup = |names: &[&str]| -> Option<String> {
            if profile != DEFAULT_PROFILE {
                if let Some(v) = self.env.var(&format!("{}_{profile}", names[0])) {
                    return Some(v);
                }
            }
            names.iter().find_map(|k| self.env.var(k))
        };
        let access_key_id = lookup(&AK_ID_VARS[..])?;
        let access_key_secret = lookup(&AK_SECRET_VARS[..])?;
        Some(ResolvedAccessKey {
            pair: AccessKeyPair {
                access_key_id,
                access_key_secret,
            },
            base_url: None,
        })
    }

    /**
     * \brief 同 resolve_api_key，未找到时返回 MissingCredential。
     */
    pub fn require_api_key(
        &self,
        kind: CredentialType,
        vendor: &str,
        profile: &str,
    ) -> StudioResult<ResolvedKey> {
        self.resolve_api_key(kind, vendor, profile)?
            .ok_or_else(|| StudioError::missing_credential(kind, vendor, profile))
    }

    pub fn require_access_key(&self, vendor: &str, profile: &str) -> StudioResult<ResolvedAccessKey> {
        self.resolve_access_key(vendor, profile)?
            .ok_or_else(|| StudioError::missing_credential(CredentialType::Imageseg, vendor, profile))
    }

    /**
     * \brief 汇总存储与环境变量中的 profile 名称，按厂商分组、去重排序。
     */
    pub fn list_profiles(&self) -> StudioResult<BTreeMap<String, VendorProfiles>> {
        let mut out: BTreeMap<String, VendorProfiles> = BTreeMap::new();

        let default_slots = [
            ("volc", CredentialType::Text),
            ("dashscope", CredentialType::Image),
            ("google", CredentialType::Image),
            ("aliyun-imageseg", CredentialType::Imageseg),
        ];
        for (vendor, kind) in default_slots {
            out.entry(vendor.to_string())
                .or_default()
                .slot(kind)
                .insert(DEFAULT_PROFILE.to_string());
        }

        let records = {
            let conn = self.db.lock();
            credentials::list(&conn)?
        };
        for rec in records {
            let vendor = if rec.vendor.is_empty() { "unknown".to_string() } else { rec.vendor };
            let profile = if rec.profile.is_empty() {
                DEFAULT_PROFILE.to_string()
            } else {
                rec.profile
            };
            out.entry(vendor).or_default().slot(rec.kind).insert(profile);
        }

        let env_patterns = [
            ("VOLC_API_KEY_", "volc", CredentialType::Text),
            ("DASHSCOPE_API_KEY_", "dashscope", CredentialType::Image),
            ("GOOGLE_API_KEY_", "google", CredentialType::Image),
            ("ALIBABA_CLOUD_ACCESS_KEY_ID_", "aliyun-imageseg", CredentialType::Imageseg),
        ];
        for key in self.env.keys() {
            for (prefix, vendor, kind) in env_patterns {
                if let Some(profile) = key.strip_prefix(prefix).filter(|p| !p.is_empty()) {
                    out.entry(vendor.to_string())
                        .or_default()
                        .slot(kind)
                        .insert(profile.to_string());
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapEnv;
    use crate::models::CredentialInput;

    fn resolver_with(env: MapEnv) -> CredentialResolver {
        let db = Db::open_in_memory().expect("db");
        CredentialResolver::new(db, SecretCodec::from_master("resolver-test"), Arc::new(env))
    }

    fn save(r: &CredentialResolver, kind: CredentialType, vendor: &str, profile: &str, key: &str) {
        let input = CredentialInput {
            id: None,
            kind,
            vendor: vendor.to_string(),
            profile: profile.to_string(),
            base_url: Some("https://store.example/v1".to_string()),
            api_key: Some(key.to_string()),
            access_key_id: None,
            access_key_secret: None,
        };
        credentials::upsert(&r.db.lock(), &r.codec, &input).expect("upsert");
    }

    #[test]
    fn test_store_wins_over_env() {
        let r = resolver_with(MapEnv::new().with("ACME_API_KEY", "env-key"));
        save(&r, CredentialType::Text, "acme", "default", "store-key");
        let got = r
            .resolve_api_key(CredentialType::Text, "acme", "default")
            .unwrap()
            .unwrap();
        assert_eq!(got.api_key, "store-key");
        assert_eq!(got.base_url.as_deref(), Some("https://store.example/v1"));
    }

    #[test]
    fn test_env_used_without_store_record() {
        let r = resolver_with(
            MapEnv::new()
                .with("ACME_API_KEY", "env-key")
                .with("ACME_API_KEY_backup", "env-backup"),
        );
        let got = r
            .resolve_api_key(CredentialType::Text, "acme", "default")
            .unwrap()
            .unwrap();
        assert_eq!(got.api_key, "env-key");
        assert!(got.base_url.is_none());

        let backup = r
            .resolve_api_key(CredentialType::Text, "acme", "backup")
            .unwrap()
            .unwrap();
        assert_eq!(backup.api_key, "env-backup");
    }

    #[test]
    fn test_legacy_aliases_and_vendor_prefix() {
        let r = resolver_with(MapEnv::new().with("AI_API_KEY", "legacy"));
        let got = r.resolve_api_key(CredentialType::Text, "volc", "default").unwrap();
        assert_eq!(got.unwrap().api_key, "legacy");
        assert_eq!(env_prefix("aliyun-imageseg"), "ALIYUN_IMAGESEG");
    }

    #[test]
    fn test_missing_image_credential_names_vendor_and_profile() {
        let r = resolver_with(MapEnv::new());
        assert!(r
            .resolve_api_key(CredentialType::Image, "dashscope", "default")
            .unwrap()
            .is_none());
        let err = r
            .require_api_key(CredentialType::Image, "dashscope", "default")
            .unwrap_err();
        assert!(matches!(err, StudioError::MissingCredential { .. }));
        assert!(err.to_string().contains("vendor=dashscope profile=default"));
    }

    #[test]
    fn test_undecryptable_record_is_unusable() {
        let r = resolver_with(MapEnv::new().with("ACME_API_KEY", "env-key"));
        save(&r, CredentialType::Text, "acme", "default", "store-key");
        let rotated = CredentialResolver::new(
            r.db.clone(),
            SecretCodec::from_master("rotated"),
            Arc::new(MapEnv::new().with("ACME_API_KEY", "env-key")),
        );
        let err = rotated
            .resolve_api_key(CredentialType::Text, "acme", "default")
            .unwrap_err();
        assert!(matches!(err, StudioError::Decryption(_)));
        assert!(err.to_string().starts_with("credential unusable"));
    }

    #[test]
    fn test_google_text_reuses_image_credential() {
        let r = resolver_with(MapEnv::new());
        save(&r, CredentialType::Image, "google", "default", "g-key");
        let got = r
            .resolve_api_key(CredentialType::Text, "google", "default")
            .unwrap()
            .unwrap();
        assert_eq!(got.api_key, "g-key");
    }

    #[test]
    fn test_access_key_from_store_and_env() {
        let r = resolver_with(
            MapEnv::new()
                .with("ALIYUN_ACCESS_KEY", "env-id")
                .with("ALIBABA_CLOUD_ACCESS_KEY_SECRET", "env-secret"),
        );
        let env_pair = r.resolve_access_key("aliyun-imageseg", "default").unwrap().unwrap();
        assert_eq!(env_pair.pair.access_key_id, "env-id");
        assert_eq!(env_pair.pair.access_key_secret, "env-secret");

        let input = CredentialInput {
            id: None,
            kind: CredentialType::Imageseg,
            vendor: "aliyun-imageseg".to_string(),
            profile: "default".to_string(),
            base_url: None,
            api_key: None,
            access_key_id: Some("store-id".to_string()),
            access_key_secret: Some("store-secret".to_string()),
        };
        credentials::upsert(&r.db.lock(), &r.codec, &input).unwrap();
        let stored = r.resolve_access_key("aliyun-imageseg", "default").unwrap().unwrap();
        assert_eq!(stored.pair.access_key_id, "store-id");
    }

    #[test]
    fn test_incomplete_access_key_record_counts_as_missing() {
        let r = resolver_with(MapEnv::new());
        let token = r.codec.encrypt(r#"{"accessKeyId":"only-id"}"#).unwrap();
        let blob = serde_json::json!([{
            "id": "x",
            "type": "imageseg",
            "vendor": "aliyun-imageseg",
            "profile": "default",
            "secretEnc": token,
            "createdAt": "t",
            "updatedAt": "t"
        }]);
        crate::db::set_config(&r.db.lock(), credentials::CREDENTIALS_KEY, &blob.to_string()).unwrap();
        assert!(r.resolve_access_key("aliyun-imageseg", "default").unwrap().is_none());
        assert!(matches!(
            r.require_access_key("aliyun-imageseg", "default"),
            Err(StudioError::MissingCredential { .. })
        ));
    }

    #[test]
    fn test_list_profiles_merges_store_and_env() {
        let r = resolver_with(
            MapEnv::new()
                .with("VOLC_API_KEY_backup", "k")
                .with("VOLC_API_KEY_alpha", "k")
                .with("ALIBABA_CLOUD_ACCESS_KEY_ID_shop", "id"),
        );
        save(&r, CredentialType::Text, "volc", "backup", "k");
        save(&r, CredentialType::Text, "acme", "primary", "k");

        let profiles = r.list_profiles().unwrap();
        let volc: Vec<&String> = profiles["volc"].text.iter().collect();
        assert_eq!(volc, ["alpha", "backup", "default"]);
        assert!(profiles["acme"].text.contains("primary"));
        assert!(profiles["aliyun-imageseg"].imageseg.contains("shop"));
        assert!(profiles["dashscope"].image.contains("default"));
    }
}
