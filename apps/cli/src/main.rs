use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use notecraft_core_sdk::prelude::*;
use std::sync::Arc;

/**
 * \brief CLI 程序入口：启动服务与后台运维操作。
 */
#[derive(Parser, Debug)]
#[command(name = "notecraft", version, about = "NoteCraft copy & image generation service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief 写入一条引擎配置。
     */
    SetConfig { key: String, value: String },

    /**
     * \brief 加密保存凭证。
     */
    SaveCredential(SaveCredentialArgs),

    /** \brief 列出凭证（脱敏）。 */
    ListCredentials,

    /** \brief 列出各厂商可用 profile。 */
    Profiles,
}

#[derive(Args, Debug)]
struct SaveCredentialArgs {
    /** \brief text / image / imageseg */
    #[arg(long = "type")]
    kind: CredentialType,
    #[arg(long)]
    vendor: String,
    #[arg(long, default_value = "default")]
    profile: String,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long, conflicts_with_all = ["access_key_id", "access_key_secret"])]
    api_key: Option<String>,
    #[arg(long, requires = "access_key_secret")]
    access_key_id: Option<String>,
    #[arg(long, requires = "access_key_id")]
    access_key_secret: Option<String>,
}

fn open_db(settings: &AppSettings) -> Result<Db> {
    let db = Db::open(&settings.db_path).context("open database failed")?;
    telemetry::set_enabled(db::get_telemetry_enabled(&db.lock()).unwrap_or(false) || settings.log_file);
    Ok(db)
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();
    let mut settings = AppSettings::from_env();

    match cli.command {
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                if ProcessEnv.var("NOTECRAFT_PUBLIC_BASE_URL").is_none() {
                    settings.public_base_url = format!("http://{addr}");
                }
                settings.addr = addr;
            }
            server::run(settings).await?;
        }
        Commands::SetConfig { key, value } => {
            let db = open_db(&settings)?;
            db::set_config(&db.lock(), &key, &value).context("save config failed")?;
            tracing::info!(%key, "config saved");
            println!("{key} = {value}");
        }
        Commands::SaveCredential(args) => {
            let db = open_db(&settings)?;
            let codec = SecretCodec::from_env(settings.production)?;
            let input = CredentialInput {
                id: None,
                kind: args.kind,
                vendor: args.vendor,
                profile: args.profile,
                base_url: args.base_url,
                api_key: args.api_key,
                access_key_id: args.access_key_id,
                access_key_secret: args.access_key_secret,
            };
            let record = credentials::upsert(&db.lock(), &codec, &input)?;
            telemetry::log_event(
                "cli.credential",
                &format!("save type={} vendor={} profile={}", record.kind, record.vendor, record.profile),
            );
            println!(
                "Saved credential id={} ({} | {} | {})",
                record.id, record.kind, record.vendor, record.profile
            );
        }
        Commands::ListCredentials => {
            let db = open_db(&settings)?;
            let codec = SecretCodec::from_env(settings.production)?;
            let views = credentials::list_views(&db.lock(), &codec).context("load credentials failed")?;
            if views.is_empty() {
                println!("(no credentials stored)");
            }
            for v in views {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    v.id, v.kind, v.vendor, v.profile, v.secret_preview, v.base_url
                );
            }
        }
        Commands::Profiles => {
            let db = open_db(&settings)?;
            let codec = SecretCodec::from_env(settings.production)?;
            let resolver = CredentialResolver::new(db, codec, Arc::new(ProcessEnv));
            let profiles = resolver.list_profiles()?;
            println!("{}", serde_json::to_string_pretty(&profiles)?);
        }
    }

    Ok(())
}
