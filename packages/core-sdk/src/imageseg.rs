//! 商品抠图：阿里云 SegmentCommodity（RPC 签名）与进程内临时图床。

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use time::{macros::format_description, OffsetDateTime};

use crate::error::StudioError;
use crate::resolver::CredentialResolver;

const IMAGESEG_ENDPOINT: &str = "https://imageseg.cn-shanghai.aliyuncs.com/";
const IMAGESEG_VERSION: &str = "2019-12-30";
const IMAGESEG_REGION: &str = "cn-shanghai";

/** \brief 连通性测试用的 1x1 红色 PNG。 */
pub const CONNECTIVITY_TEST_PNG: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg==";

pub const TEMP_IMAGE_TTL: Duration = Duration::from_secs(30 * 60);
pub const TEMP_IMAGE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/**
 * \brief 抠图能力：输入 base64（不含 data: 前缀），返回透明底 PNG 的 base64。
 */
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(&self, image_b64: &str) -> Result<String>;
}

struct TempEntry {
    bytes: Vec<u8>,
    stored_at: Instant,
}

/**
 * \brief 临时图床：抠图厂商只接受公网 URL，先把图片挂在这里。
 * \details 仅进程内有效，多实例部署需换成带 TTL 的对象存储。
 */
#[derive(Clone)]
pub struct TempImageStore {
    entries: Arc<Mutex<HashMap<String, TempEntry>>>,
    ttl: Duration,
}

impl Default for TempImageStore {
    fn default() -> Self {
        Self::new(TEMP_IMAGE_TTL)
    }
}

impl TempImageStore {
    pub fn new(ttl: Duration) -> Self {
        TempImageStore {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /** \brief 存入 base64 图片，返回 id。 */
    pub fn put_base64(&self, image_b64: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(crate::image::strip_data_uri(image_b64.trim()))
            .context("invalid base64 image")?;
        Ok(self.put(bytes))
    }

    pub fn put(&self, bytes: Vec<u8>) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(
            id.clone(),
            TempEntry {
                bytes,
                stored_at: Instant::now(),
            },
        );
        id
    }

    /** \brief 读取未过期的图片。 */
    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get(id)
            .filter(|e| e.stored_at.elapsed() <= self.ttl)
            .map(|e| e.bytes.clone())
    }

    /** \brief 清除过期条目，返回清除数量。 */
    pub fn sweep(&self) -> usize {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = guard.len();
        let ttl = self.ttl;
        guard.retain(|_, e| e.stored_at.elapsed() <= ttl);
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /**
     * \brief 启动后台清理任务。
     */
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "temp images expired");
                }
            }
        })
    }
}

/** \brief RFC 3986 百分号编码（阿里云 RPC 签名要求）。 */
fn percent_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/**
 * \brief 计算 RPC 签名：HMAC-SHA1(secret + "&", "GET&%2F&" + encode(query))。
 */
fn rpc_signature(params: &BTreeMap<String, String>, secret: &str) -> Result<String> {
    let string_to_sign = format!("GET&{}&{}", percent_encode("/"), percent_encode(&canonical_query(params)));
    let mut mac = Hmac::<Sha1>::new_from_slice(format!("{secret}&").as_bytes())
        .map_err(|e| anyhow!("hmac init failed: {e}"))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn signed_url(action: &str, extra: &[(&str, &str)], access_key_id: &str, secret: &str) -> Result<String> {
    let timestamp = OffsetDateTime::now_utc()
        .format(format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z"))?;
    let mut params: BTreeMap<String, String> = [
        ("AccessKeyId", access_key_id),
        ("Action", action),
        ("Format", "JSON"),
        ("RegionId", IMAGESEG_REGION),
        ("SignatureMethod", "HMAC-SHA1"),
        ("SignatureVersion", "1.0"),
        ("Version", IMAGESEG_VERSION),
    ]
    .into_iter()
    .chain(extra.iter().copied())
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    params.insert("SignatureNonce".to_string(), uuid::Uuid::new_v4().to_string());
    params.insert("Timestamp".to_string(), timestamp);
    let signature = rpc_signature(&params, secret)?;
    params.insert("Signature".to_string(), signature);
    Ok(format!("{}?{}", IMAGESEG_ENDPOINT, canonical_query(&params)))
}

fn parse_segment_response(v: &Value) -> Result<String> {
    if let Some(code) = v.get("Code").and_then(|c| c.as_str()) {
        if code != "200" {
            let msg = v.get("Message").and_then(|m| m.as_str()).unwrap_or(code);
            return Err(anyhow!("Aliyun imageseg error {code}: {msg}"));
        }
    }
    let url = v
        .pointer("/Data/ImageURL")
        .and_then(|u| u.as_str())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| anyhow!("Aliyun imageseg returned empty ImageURL"))?;
    Ok(match url.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    })
}

/**
 * \brief 抠图失败原因的人工可读分析。
 */
pub fn diagnose_failure(err: &anyhow::Error) -> &'static str {
    if matches!(
        err.downcast_ref::<StudioError>(),
        Some(StudioError::MissingCredential { .. } | StudioError::Decryption(_))
    ) {
        return "凭证未配置或无法读取";
    }
    if err.downcast_ref::<reqwest::Error>().is_some_and(|e| e.is_timeout() || e.is_connect()) {
        return "网络连接问题";
    }
    let msg = err.to_string();
    if msg.contains("NotPurchase") || msg.contains("not purchased") {
        "服务未开通：请在阿里云控制台开通“图像分割（ImageSeg）”服务后重试"
    } else if msg.contains("<!DOCTYPE") || msg.contains("HTML") {
        "接口返回了 HTML 而不是 JSON：凭证无效或权限不足、服务未开通，或端点错误"
    } else {
        "未知错误，需要查看详细日志"
    }
}

/**
 * \brief 阿里云商品分割。凭证在调用时解析，缺失即报错（由管线退化为原图）。
 */
pub struct AliyunSegmenter {
    http: reqwest::Client,
    resolver: CredentialResolver,
    vendor: String,
    profile: String,
    temp: TempImageStore,
    public_base_url: String,
}

impl AliyunSegmenter {
    pub fn new(
        http: reqwest::Client,
        resolver: CredentialResolver,
        vendor: &str,
        profile: &str,
        temp: TempImageStore,
        public_base_url: &str,
    ) -> Self {
        AliyunSegmenter {
            http,
            resolver,
            vendor: vendor.to_string(),
            profile: profile.to_string(),
            temp,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Segmenter for AliyunSegmenter {
    async fn segment(&self, image_b64: &str) -> Result<String> {
        let (resolver, vendor, profile) = (self.resolver.clone(), self.vendor.clone(), self.profile.clone());
        let creds = tokio::task::spawn_blocking(move || resolver.require_access_key(&vendor, &profile)).await??;
        let id = self.temp.put_base64(image_b64)?;
        let image_url = format!("{}/api/temp-image?id={}", self.public_base_url, id);
        tracing::debug!(%image_url, "segmenting via temp image host");

        let url = signed_url(
            "SegmentCommodity",
            &[("ImageURL", image_url.as_str())],
            &creds.pair.access_key_id,
            &creds.pair.access_key_secret,
        )?;
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let v: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let code = v.get("Code").and_then(|c| c.as_str()).unwrap_or("-");
            let msg = v.get("Message").and_then(|m| m.as_str()).unwrap_or("request failed");
            return Err(anyhow!("Aliyun imageseg {} {}: {}", status, code, msg));
        }
        let cutout_url = parse_segment_response(&v)?;

        let img = self.http.get(&cutout_url).send().await?;
        if !img.status().is_success() {
            return Err(anyhow!("failed to fetch cutout image: {}", img.status()));
        }
        let bytes = img.bytes().await?;
        tracing::info!(size = bytes.len(), "segmentation succeeded");
        Ok(STANDARD.encode(bytes))
    }
}
