//! 批量下载：服务端抓取图片（URL 或 data URI）并打包为 tar.gz。

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{write::GzEncoder, Compression};
use tar::{Builder, Header};

use crate::error::{StudioError, StudioResult};
use crate::image::strip_data_uri;

const DEFAULT_ARCHIVE_NAME: &str = "images";
const MAX_NAME_CHARS: usize = 40;

/**
 * \brief 远程资源抓取。
 */
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        HttpFetcher { http }
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("fetch {} failed: {}", url, resp.status()));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/**
 * \brief 打包结果。
 */
#[derive(Debug)]
pub struct Archive {
    pub name: String,
    pub bytes: Vec<u8>,
    pub included: usize,
    /** \brief 被跳过的条目序号（从 1 开始） */
    pub skipped: Vec<usize>,
}

/**
 * \brief 压缩包/目录名：取前 40 个字符，替换路径和引号字符；纯点号名回退为默认名。
 */
pub fn archive_name(name: Option<&str>) -> String {
    let base = name
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.chars().all(|c| c == '.'))
        .unwrap_or(DEFAULT_ARCHIVE_NAME);
    base.chars()
        .take(MAX_NAME_CHARS)
        .map(|c| match c {
            '/' | '\\' | '"' => '_',
            c => c,
        })
        .collect()
}

async fn load_asset(url: &str, fetcher: &dyn AssetFetcher) -> Result<Vec<u8>> {
    if url.starts_with("data:image") {
        let data = strip_data_uri(url);
        if data.is_empty() || data == url {
            return Err(anyhow!("data URI without base64 payload"));
        }
        return Ok(STANDARD.decode(data)?);
    }
    fetcher.fetch(url).await
}

fn append_entry<W: std::io::Write>(tar: &mut Builder<W>, path: &str, data: &[u8]) -> std::io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(time::OffsetDateTime::now_utc().unix_timestamp().max(0) as u64);
    header.set_cksum();
    tar.append_data(&mut header, path, data)
}

/**
 * \brief 逐个抓取并写入 `<name>/image-<n>.png`；单个失败跳过，不中断整体。
 */
pub async fn package(urls: &[String], name: Option<&str>, fetcher: &dyn AssetFetcher) -> StudioResult<Archive> {
    let urls: Vec<&String> = urls.iter().filter(|u| !u.trim().is_empty()).collect();
    if urls.is_empty() {
        return Err(StudioError::InvalidInput("urls 不能为空".to_string()));
    }
    let folder = archive_name(name);

    let mut entries: Vec<(String, Vec<u8>)> = Vec::with_capacity(urls.len());
    let mut skipped = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        match load_asset(url, fetcher).await {
            Ok(bytes) => entries.push((format!("{folder}/image-{}.png", i + 1), bytes)),
            Err(err) => {
                tracing::warn!(index = i + 1, error = %err, "skipping archive entry");
                skipped.push(i + 1);
            }
        }
    }

    let mut bytes = Vec::new();
    {
        let encoder = GzEncoder::new(&mut bytes, Compression::default());
        let mut tar = Builder::new(encoder);
        for (path, data) in &entries {
            append_entry(&mut tar, path, data).map_err(|e| StudioError::Storage(e.into()))?;
        }
        tar.into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(|e| StudioError::Storage(e.into()))?;
    }
    tracing::info!(included = entries.len(), skipped = skipped.len(), "archive built");
    Ok(Archive {
        name: folder,
        bytes,
        included: entries.len(),
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Read;

    struct MapFetcher;

    #[async_trait]
    impl AssetFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            match url {
                "https://cdn.example/ok.png" => Ok(b"remote".to_vec()),
                _ => Err(anyhow!("404")),
            }
        }
    }

    fn read_entries(bytes: &[u8]) -> HashMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes));
        let mut out = HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.insert(path, data);
        }
        out
    }

    #[tokio::test]
    async fn test_unreachable_entry_is_skipped() {
        let urls = vec![
            "data:image/png;base64,QUJD".to_string(),
            "https://cdn.example/missing.png".to_string(),
            "https://cdn.example/ok.png".to_string(),
        ];
        let archive = package(&urls, Some("保温杯 合集"), &MapFetcher).await.unwrap();
        assert_eq!(archive.included, 2);
        assert_eq!(archive.skipped, vec![2]);
        let entries = read_entries(&archive.bytes);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["保温杯 合集/image-1.png"], b"ABC".to_vec());
        assert_eq!(entries["保温杯 合集/image-3.png"], b"remote".to_vec());
        assert!(!entries.contains_key("保温杯 合集/image-2.png"));
    }

    #[tokio::test]
    async fn test_empty_urls_rejected() {
        let err = package(&[" ".to_string()], None, &MapFetcher).await.unwrap_err();
        assert!(matches!(err, StudioError::InvalidInput(_)));
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(archive_name(None), "images");
        assert_eq!(archive_name(Some("a/b\"c")), "a_b_c");
        assert_eq!(archive_name(Some(&"长".repeat(50))).chars().count(), 40);
        assert_eq!(archive_name(Some("..")), "images");
        assert_eq!(archive_name(Some(" . ")), "images");
        assert_eq!(archive_name(Some("../x")), ".._x");
    }

    #[tokio::test]
    async fn test_dot_name_still_builds_archive() {
        let urls = vec!["https://cdn.example/ok.png".to_string()];
        let archive = package(&urls, Some(".."), &MapFetcher).await.unwrap();
        assert_eq!(archive.name, "images");
        let entries = read_entries(&archive.bytes);
        assert_eq!(entries["images/image-1.png"], b"remote".to_vec());
    }
}
