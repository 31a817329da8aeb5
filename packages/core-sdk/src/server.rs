use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::config::{
    effective_base_url, AppSettings, EnvSource, FallbackPayloads, ImageEngineConfig,
    ImagesegConfig, ProcessEnv, TextEngineConfig,
};
use crate::credentials::{self, CREDENTIALS_KEY};
use crate::crypto::SecretCodec;
use crate::db::{self, Db};
use crate::error::StudioError;
use crate::generation::{
    generate_validated, parse_copy_options, parse_image_prompts, CopyLimits, GenerationRequest,
    ImagePromptLimits, RetryPolicy,
};
use crate::image::{self, AdapterRegistry, ImageEndpoint, ImageJob, ImageVendorAdapter, PipelineOptions};
use crate::imageseg::{
    self, AliyunSegmenter, Segmenter, TempImageStore, CONNECTIVITY_TEST_PNG, TEMP_IMAGE_SWEEP_INTERVAL,
};
use crate::llm::{self, ChatClient, TextEndpoint, TextGenerator};
use crate::models::{CredentialInput, CredentialType, ProviderInput, RefImage};
use crate::packaging::{self, HttpFetcher};
use crate::providers::{self, PROVIDERS_KEY};
use crate::resolver::CredentialResolver;
use crate::{telemetry, template};

/** \brief 上传参考图为 base64，放宽请求体上限。 */
const BODY_LIMIT_BYTES: usize = 25 * 1024 * 1024;

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<T, ApiError>;

/**
 * \brief 请求处理器共享状态：启动时构建一次。
 */
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub resolver: CredentialResolver,
    pub http: reqwest::Client,
    pub adapters: AdapterRegistry,
    pub temp_images: TempImageStore,
    pub settings: Arc<AppSettings>,
    text_generator: Option<Arc<dyn TextGenerator>>,
    segmenter: Option<Arc<dyn Segmenter>>,
}

impl AppState {
    pub fn new(settings: AppSettings, db: Db, codec: SecretCodec, env: Arc<dyn EnvSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.vendor_timeout)
            .build()?;
        Ok(AppState {
            resolver: CredentialResolver::new(db.clone(), codec, env),
            adapters: AdapterRegistry::with_defaults(http.clone()),
            db,
            http,
            temp_images: TempImageStore::default(),
            settings: Arc::new(settings),
            text_generator: None,
            segmenter: None,
        })
    }

    /** \brief 固定文本生成器，忽略厂商配置。 */
    pub fn with_text_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.text_generator = Some(generator);
        self
    }

    pub fn with_segmenter(mut self, segmenter: Arc<dyn Segmenter>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    pub fn with_image_adapter(mut self, vendor: &str, adapter: Arc<dyn ImageVendorAdapter>) -> Self {
        self.adapters.register(vendor, adapter);
        self
    }

    fn text_client(&self, endpoint: TextEndpoint) -> Arc<dyn TextGenerator> {
        match &self.text_generator {
            Some(generator) => generator.clone(),
            None => Arc::new(ChatClient::new(self.http.clone(), endpoint)),
        }
    }

    fn segmenter_for(&self, cfg: &ImagesegConfig) -> Arc<dyn Segmenter> {
        match &self.segmenter {
            Some(s) => s.clone(),
            None => Arc::new(AliyunSegmenter::new(
                self.http.clone(),
                self.resolver.clone(),
                &cfg.vendor,
                &cfg.profile,
                self.temp_images.clone(),
                &self.settings.public_base_url,
            )),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Some(self.settings.vendor_timeout),
            ..RetryPolicy::default()
        }
    }

    /**
     * \brief 凭证解析需要读库，放到阻塞线程池执行。
     */
    async fn resolve<T, F>(&self, f: F) -> Result<T, StudioError>
    where
        F: FnOnce(&CredentialResolver) -> Result<T, StudioError> + Send + 'static,
        T: Send + 'static,
    {
        let resolver = self.resolver.clone();
        tokio::task::spawn_blocking(move || f(&resolver))
            .await
            .map_err(|e| StudioError::Storage(e.into()))?
    }

    /**
     * \brief 按文案引擎配置解析凭证、baseURL 与模型。
     */
    async fn text_endpoint(&self, cfg: &TextEngineConfig) -> Result<TextEndpoint, StudioError> {
        let (vendor, profile) = (cfg.vendor.clone(), cfg.profile.clone());
        let key = self
            .resolve(move |r| r.require_api_key(CredentialType::Text, &vendor, &profile))
            .await?;
        let env = self.resolver.env();
        Ok(TextEndpoint {
            vendor: cfg.vendor.clone(),
            base_url: effective_base_url(
                cfg.base_url.as_deref(),
                key.base_url.as_deref(),
                CredentialType::Text,
                &cfg.vendor,
                env,
            ),
            api_key: key.api_key,
            model: cfg.model_or_default(env),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        })
    }
}

/**
 * \brief 构建路由。
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/admin/credential-store",
            get(list_credential_store)
                .post(save_credential)
                .delete(delete_credential),
        )
        .route("/api/admin/credentials", get(list_credential_profiles))
        .route(
            "/api/admin/providers",
            get(list_providers).post(save_provider).delete(delete_provider),
        )
        .route("/api/admin/providers/{id}/apply", post(apply_provider))
        .route("/api/admin/config", get(get_config).post(set_config))
        .route("/api/admin/stats", get(stats))
        .route("/api/generate/copy", post(generate_copy))
        .route("/api/generate/image-prompts", post(generate_image_prompts))
        .route("/api/generate/image/one", post(generate_image_one))
        .route("/api/temp-image", get(get_temp_image).post(put_temp_image))
        .route("/api/download/images", post(download_images))
        .route("/api/test/models", get(test_models))
        .route("/api/test/imageseg", get(test_imageseg).post(test_imageseg))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief 启动 HTTP 服务。
 * \param settings 进程设置（数据库路径、监听地址等）
 */
pub async fn run(settings: AppSettings) -> Result<()> {
    let db = Db::open(&settings.db_path)?;
    let codec = SecretCodec::from_env(settings.production)?;
    let telemetry_enabled = db::get_telemetry_enabled(&db.lock())? || settings.log_file;
    telemetry::set_enabled(telemetry_enabled);

    let addr = settings.addr.clone();
    let state = AppState::new(settings, db, codec, Arc::new(ProcessEnv))?;
    state.temp_images.spawn_sweeper(TEMP_IMAGE_SWEEP_INTERVAL);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "server listening");
    telemetry::log_event("server", &format!("listening on http://{addr}"));
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/**
 * \brief 错误映射为 `{"error": "..."}`。
 */
fn api_err(err: impl Into<StudioError>) -> ApiError {
    let err = err.into();
    let status = match &err {
        StudioError::InvalidInput(_) | StudioError::Disabled(_) | StudioError::Template(_) => {
            StatusCode::BAD_REQUEST
        }
        StudioError::NotFound(_) => StatusCode::NOT_FOUND,
        StudioError::Vendor(_) => StatusCode::BAD_GATEWAY,
        StudioError::MissingCredential { .. }
        | StudioError::Decryption(_)
        | StudioError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        telemetry::log_error("server", &err.to_string());
    }
    (status, Json(json!({ "error": err.to_string() })))
}

fn invalid(message: &str) -> ApiError {
    api_err(StudioError::InvalidInput(message.to_string()))
}

/** \brief 手动反序列化请求体，使字段错误也返回 JSON 400。 */
fn parse_body<T: DeserializeOwned>(body: Value) -> ApiResult<T> {
    serde_json::from_value(body).map_err(|e| invalid(&format!("请求参数不合法: {e}")))
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[derive(Deserialize, Debug)]
struct IdQuery {
    id: Option<String>,
}

fn require_id(q: IdQuery) -> ApiResult<String> {
    q.id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("缺少 id"))
}

async fn list_credential_store(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let codec = state.resolver.codec().clone();
    let views = state
        .db
        .call(move |conn| credentials::list_views(conn, &codec))
        .await
        .map_err(api_err)?;
    Ok(Json(json!({ "credentials": views })))
}

async fn save_credential(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let input: CredentialInput = parse_body(body)?;
    let codec = state.resolver.codec().clone();
    let mut record = state
        .db
        .call(move |conn| credentials::upsert(conn, &codec, &input))
        .await
        .map_err(api_err)?;
    telemetry::log_event(
        "server.credential",
        &format!("save type={} vendor={} profile={}", record.kind, record.vendor, record.profile),
    );
    record.secret_enc.clear();
    Ok(Json(json!({ "credential": record })))
}

async fn delete_credential(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> ApiResult<Json<Value>> {
    let id = require_id(q)?;
    let target = id.clone();
    let removed = state
        .db
        .call(move |conn| credentials::delete(conn, &target))
        .await
        .map_err(api_err)?;
    if !removed {
        return Err(api_err(StudioError::NotFound(format!("credential {id}"))));
    }
    telemetry::log_event("server.credential", &format!("delete id={id}"));
    Ok(Json(json!({ "success": true })))
}

async fn list_credential_profiles(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let profiles = state.resolve(|r| r.list_profiles()).await.map_err(api_err)?;
    Ok(Json(json!({
        "profiles": profiles,
        "help": {
            "volc": "可来自 env：VOLC_API_KEY_<PROFILE> 或后台 API 管理中心（vendor=volc, type=text）",
            "dashscope": "可来自 env：DASHSCOPE_API_KEY_<PROFILE> 或后台 API 管理中心（vendor=dashscope, type=image）",
            "google": "可来自 env：GOOGLE_API_KEY_<PROFILE> 或后台 API 管理中心（vendor=google）",
            "imageseg": "可来自 env：ALIBABA_CLOUD_ACCESS_KEY_*_<PROFILE> 或后台 API 管理中心（vendor=aliyun-imageseg, type=imageseg）"
        }
    })))
}

async fn list_providers(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let list = state.db.call(providers::list).await.map_err(api_err)?;
    Ok(Json(json!({ "providers": list })))
}

async fn save_provider(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let input: ProviderInput = parse_body(body)?;
    let preset = state
        .db
        .call(move |conn| providers::upsert(conn, &input))
        .await
        .map_err(api_err)?;
    Ok(Json(json!({ "provider": preset })))
}

async fn delete_provider(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> ApiResult<Json<Value>> {
    let id = require_id(q)?;
    let target = id.clone();
    let removed = state
        .db
        .call(move |conn| providers::delete(conn, &target))
        .await
        .map_err(api_err)?;
    if !removed {
        return Err(api_err(StudioError::NotFound(format!("provider {id}"))));
    }
    Ok(Json(json!({ "success": true })))
}

async fn apply_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let preset = state
        .db
        .call(move |conn| providers::apply(conn, &id))
        .await
        .map_err(api_err)?;
    Ok(Json(json!({ "provider": preset })))
}

fn is_blob_key(key: &str) -> bool {
    key == CREDENTIALS_KEY || key == PROVIDERS_KEY
}

async fn get_config(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let rows = state.db.call(db::list_config).await.map_err(api_err)?;
    let config: BTreeMap<String, String> = rows.into_iter().filter(|(k, _)| !is_blob_key(k)).collect();
    Ok(Json(json!({ "config": config })))
}

async fn set_config(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let entries: BTreeMap<String, Value> = parse_body(body)?;
    if let Some(key) = entries.keys().find(|k| is_blob_key(k)) {
        return Err(invalid(&format!("{key} 只能通过专用接口修改")));
    }
    let rows: Vec<(String, String)> = entries
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect();
    let updated = rows.len();
    let telemetry_flag = rows
        .iter()
        .find(|(k, _)| k == "telemetry_enabled")
        .map(|(_, v)| db::parse_bool(v));
    state
        .db
        .call(move |conn| {
            rows.iter()
                .try_for_each(|(key, value)| db::set_config(conn, key, value))
        })
        .await
        .map_err(api_err)?;
    if let Some(enabled) = telemetry_flag {
        telemetry::set_enabled(enabled);
    }
    tracing::info!(keys = updated, "config updated");
    Ok(Json(json!({ "success": true, "updated": updated })))
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let (generations, credentials, providers) = state
        .db
        .call(|conn| -> anyhow::Result<_> {
            Ok((
                db::get_generation_count(conn)?,
                credentials::list(conn)?.len(),
                providers::list(conn)?.len(),
            ))
        })
        .await
        .map_err(api_err)?;
    Ok(Json(json!({
        "generationCount": generations,
        "credentialCount": credentials,
        "providerCount": providers,
    })))
}

async fn record_generation(state: &AppState, kind: &str) {
    match state.db.call(db::increment_generation_count).await {
        Ok(total) => telemetry::log_event("server.generate", &format!("{kind} ok total={total}")),
        Err(err) => tracing::warn!(error = %err, "generation counter update failed"),
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CopyRequest {
    #[serde(default)]
    product_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    image_url: Option<String>,
}

async fn generate_copy(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let req: CopyRequest = parse_body(body)?;
    let product_name = req.product_name.trim();
    let description = req.description.trim();
    if product_name.is_empty() || description.is_empty() {
        return Err(invalid("productName 和 description 不能为空"));
    }
    let (cfg, fallback) = state
        .db
        .call(|conn| -> anyhow::Result<_> { Ok((TextEngineConfig::load(conn)?, FallbackPayloads::load(conn)?)) })
        .await
        .map_err(api_err)?;
    if !cfg.enabled {
        return Err(api_err(StudioError::Disabled("文案引擎已在后台关闭".to_string())));
    }
    let endpoint = state.text_endpoint(&cfg).await.map_err(api_err)?;
    let images: Vec<String> = req
        .image_url
        .into_iter()
        .filter(|u| !u.trim().is_empty())
        .collect();
    let prompt = template::copy_request(
        cfg.copy_template.as_deref(),
        product_name,
        description,
        !images.is_empty(),
    )
    .map_err(api_err)?;

    let generator = state.text_client(endpoint);
    let limits = CopyLimits::default();
    let outcome = generate_validated(
        generator.as_ref(),
        &GenerationRequest {
            system: Some(template::COPY_SYSTEM_PROMPT),
            prompt: &prompt,
            images: &images,
        },
        state.retry_policy(),
        |raw| parse_copy_options(raw, &limits),
        fallback.copy_options,
    )
    .await;
    if !outcome.degraded {
        record_generation(&state, "copy").await;
    }
    Ok(Json(json!({
        "options": outcome.value,
        "attempts": outcome.attempts,
        "degraded": outcome.degraded,
    })))
}

#[derive(Deserialize, Debug)]
struct ImagePromptsRequest {
    #[serde(default)]
    copy: String,
}

async fn generate_image_prompts(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let req: ImagePromptsRequest = parse_body(body)?;
    let (cfg, fallback) = state
        .db
        .call(|conn| -> anyhow::Result<_> { Ok((TextEngineConfig::load(conn)?, FallbackPayloads::load(conn)?)) })
        .await
        .map_err(api_err)?;
    if !cfg.enabled {
        return Err(api_err(StudioError::Disabled("文案引擎已在后台关闭".to_string())));
    }
    let prompt = template::image_prompt_request(cfg.image_prompt_template.as_deref(), req.copy.trim())
        .map_err(api_err)?;
    let endpoint = state.text_endpoint(&cfg).await.map_err(api_err)?;

    let generator = state.text_client(endpoint);
    let limits = ImagePromptLimits::default();
    let outcome = generate_validated(
        generator.as_ref(),
        &GenerationRequest {
            system: None,
            prompt: &prompt,
            images: &[],
        },
        state.retry_policy(),
        |raw| parse_image_prompts(raw, &limits),
        fallback.image_prompts,
    )
    .await;
    if !outcome.degraded {
        record_generation(&state, "image-prompts").await;
    }
    Ok(Json(json!({
        "prompts": outcome.value,
        "attempts": outcome.attempts,
        "degraded": outcome.degraded,
    })))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ImageOneRequest {
    #[serde(default)]
    product_name: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    positive_prompt: Option<String>,
    #[serde(default)]
    negative_prompt: Option<String>,
    #[serde(default)]
    images: Vec<RefImage>,
    #[serde(default)]
    primary_index: Option<usize>,
}

async fn generate_image_one(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let req: ImageOneRequest = parse_body(body)?;
    if req.prompt.trim().is_empty() {
        return Err(invalid("prompt 不能为空"));
    }
    let (cfg, seg_cfg) = state
        .db
        .call(|conn| -> anyhow::Result<_> { Ok((ImageEngineConfig::load(conn)?, ImagesegConfig::load(conn)?)) })
        .await
        .map_err(api_err)?;
    if !cfg.enabled {
        return Err(api_err(StudioError::Disabled("配图引擎已在后台关闭".to_string())));
    }
    let (vendor, profile) = (cfg.vendor.clone(), cfg.profile.clone());
    let key = state
        .resolve(move |r| r.require_api_key(CredentialType::Image, &vendor, &profile))
        .await
        .map_err(api_err)?;
    let env = state.resolver.env();
    let endpoint = ImageEndpoint {
        vendor: cfg.vendor.clone(),
        base_url: effective_base_url(
            cfg.base_url.as_deref(),
            key.base_url.as_deref(),
            CredentialType::Image,
            &cfg.vendor,
            env,
        ),
        api_key: key.api_key,
        model: cfg.model_or_default(env),
    };

    let job = ImageJob {
        product_name: req.product_name.trim().to_string(),
        prompt: req.prompt.trim().to_string(),
        positive_prompt: req.positive_prompt,
        negative_prompt: req.negative_prompt,
        images: req.images,
        primary_index: req.primary_index,
    };
    let segmenter = seg_cfg.enabled.then(|| state.segmenter_for(&seg_cfg));
    let options = PipelineOptions {
        configured_negative_prompt: cfg.negative_prompt.clone(),
        prompt_extend: cfg.prompt_extend,
    };
    let adapter = state.adapters.get(&cfg.vendor);
    let output = image::generate_image(&job, &endpoint, adapter.as_ref(), segmenter.as_deref(), &options)
        .await
        .map_err(|e| api_err(StudioError::Vendor(e.to_string())))?;
    record_generation(&state, "image").await;
    Ok(Json(json!({ "url": output.into_url() })))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TempImageRequest {
    #[serde(default)]
    image_base64: String,
}

async fn put_temp_image(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let req: TempImageRequest = parse_body(body)?;
    if req.image_base64.trim().is_empty() {
        return Err(invalid("需要 imageBase64"));
    }
    let id = state
        .temp_images
        .put_base64(&req.image_base64)
        .map_err(|e| invalid(&e.to_string()))?;
    let url = format!("{}/api/temp-image?id={}", state.settings.public_base_url, id);
    Ok(Json(json!({ "id": id, "url": url })))
}

async fn get_temp_image(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> ApiResult<Response> {
    let id = require_id(q)?;
    let bytes = state
        .temp_images
        .get(&id)
        .ok_or_else(|| api_err(StudioError::NotFound("图片不存在或已过期".to_string())))?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Deserialize, Debug)]
struct DownloadRequest {
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    name: Option<String>,
}

async fn download_images(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let req: DownloadRequest = parse_body(body)?;
    let fetcher = HttpFetcher::new(state.http.clone());
    let archive = packaging::package(&req.urls, req.name.as_deref(), &fetcher)
        .await
        .map_err(api_err)?;
    let disposition = format!(
        "attachment; filename*=UTF-8''{}.tar.gz",
        urlencoding::encode(&archive.name)
    );
    let disposition = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"images.tar.gz\""));
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/gzip")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        archive.bytes,
    )
        .into_response())
}

async fn test_models(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cfg = state.db.call(TextEngineConfig::load).await.map_err(api_err)?;
    let endpoint = state.text_endpoint(&cfg).await.map_err(api_err)?;
    let models = llm::list_models(&state.http, &endpoint)
        .await
        .map_err(|e| api_err(StudioError::Vendor(e.to_string())))?;
    Ok(Json(json!({
        "ok": true,
        "vendor": endpoint.vendor,
        "baseURL": endpoint.base_url,
        "model": endpoint.model,
        "models": models,
    })))
}

/**
 * \brief 抠图连通性测试：用配置的 profile 处理一张 1x1 图片。
 */
async fn test_imageseg(State(state): State<AppState>) -> ApiResult<Response> {
    let cfg = state.db.call(ImagesegConfig::load).await.map_err(api_err)?;
    let segmenter = state.segmenter_for(&cfg);
    match segmenter.segment(CONNECTIVITY_TEST_PNG).await {
        Ok(result) => {
            let preview: String = result.chars().take(50).collect();
            Ok(Json(json!({
                "success": true,
                "message": "抠图功能正常",
                "vendor": cfg.vendor,
                "profile": cfg.profile,
                "resultLength": result.len(),
                "preview": format!("{preview}..."),
            }))
            .into_response())
        }
        Err(err) => {
            telemetry::log_error("server.imageseg", &format!("{err:#}"));
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": format!("{err:#}"),
                    "analysis": imageseg::diagnose_failure(&err),
                    "vendor": cfg.vendor,
                    "profile": cfg.profile,
                })),
            )
                .into_response())
        }
    }
}
