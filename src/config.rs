use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::{ArgAction, Parser, Subcommand};
use sqlx::postgres::PgConnectOptions;

use crate::cli::*;

/// 默认的最小可用内存：200MB
pub const DEFAULT_MIN_FREE_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "drive-photo-search", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 启动 HTTP 服务
    Server(ServerCommand),
    /// 从 Drive 文件夹导入图片：获取、生成描述、入库
    Import(ImportCommand),
    /// 使用自然语言搜索图片
    Search(SearchCommand),
    /// 初始化数据库表结构
    Migrate(MigrateCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct LoadOptions {
    /// 跳过模型加载，设置为 1 时所有依赖模型的接口都会返回未就绪
    #[arg(long, env = "SKIP_MODEL_LOAD", default_value = "0", action = ArgAction::Set, value_parser = parse_switch)]
    pub skip_model_load: bool,
    /// 可用内存低于该值（字节）时放弃加载模型
    #[arg(long, value_name = "BYTES", env = "MIN_FREE_BYTES", default_value_t = DEFAULT_MIN_FREE_BYTES)]
    pub min_free_bytes: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { skip_model_load: false, min_free_bytes: DEFAULT_MIN_FREE_BYTES }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ModelOptions {
    /// 图片描述模型
    #[arg(long, value_name = "REPO", env = "CAPTION_MODEL", default_value = "Salesforce/blip-image-captioning-large")]
    pub caption_model: String,
    /// 图片描述模型的版本
    #[arg(long, value_name = "REV", env = "CAPTION_MODEL_REVISION", default_value = "refs/pr/18")]
    pub caption_revision: String,
    /// 描述最大 token 数
    #[arg(long, value_name = "N", default_value_t = 50)]
    pub caption_max_tokens: usize,
    /// 文本向量模型
    #[arg(long, value_name = "REPO", env = "EMBEDDING_MODEL", default_value = "sentence-transformers/all-MiniLM-L6-v2")]
    pub embedding_model: String,
    /// 文本向量模型的版本
    #[arg(long, value_name = "REV", env = "EMBEDDING_MODEL_REVISION", default_value = "refs/pr/21")]
    pub embedding_revision: String,
    /// 强制使用 CPU 推理
    #[arg(long)]
    pub cpu: bool,
    /// 下载图片的超时时间，单位为秒
    #[arg(long, value_name = "SECS", env = "FETCH_TIMEOUT", default_value_t = 10)]
    pub fetch_timeout: u64,
    /// 同时下载的图片数量
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub fetch_concurrency: usize,
}

impl ModelOptions {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            caption_model: "Salesforce/blip-image-captioning-large".to_string(),
            caption_revision: "refs/pr/18".to_string(),
            caption_max_tokens: 50,
            embedding_model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            embedding_revision: "refs/pr/21".to_string(),
            cpu: false,
            fetch_timeout: 10,
            fetch_concurrency: 4,
        }
    }
}

/// Drive v3 API 的默认地址
pub const DEFAULT_DRIVE_API_URL: &str = "https://www.googleapis.com/drive/v3";

#[derive(Parser, Debug, Clone)]
pub struct DriveOptions {
    /// Google 服务账号 JSON 内容
    #[arg(long, value_name = "JSON", env = "GOOGLE_APPLICATION_CREDENTIALS_JSON", hide_env_values = true)]
    pub google_credentials_json: Option<String>,
    /// 预先签发的 Drive access token，设置后不再使用服务账号
    #[arg(long, value_name = "TOKEN", env = "GOOGLE_DRIVE_ACCESS_TOKEN", hide_env_values = true)]
    pub drive_access_token: Option<String>,
    /// Drive API 地址
    #[arg(long, value_name = "URL", env = "DRIVE_API_URL", default_value = DEFAULT_DRIVE_API_URL)]
    pub drive_api_url: String,
}

impl Default for DriveOptions {
    fn default() -> Self {
        Self {
            google_credentials_json: None,
            drive_access_token: None,
            drive_api_url: DEFAULT_DRIVE_API_URL.to_string(),
        }
    }
}

#[derive(Parser, Debug, Clone, Default)]
pub struct DatabaseOptions {
    /// PostgreSQL 连接串，优先于 Supabase 配置
    #[arg(long, value_name = "URL", env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
    /// Supabase 项目地址，例如 https://<ref>.supabase.co
    #[arg(long, value_name = "URL", env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,
    /// Supabase 数据库密码
    #[arg(long, value_name = "KEY", env = "SUPABASE_SERVICE_ROLE_KEY", hide_env_values = true)]
    pub supabase_service_role_key: Option<String>,
}

impl DatabaseOptions {
    /// 解析数据库连接参数
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        if let Some(url) = &self.database_url {
            return Ok(url.parse()?);
        }
        let supabase_url = self
            .supabase_url
            .as_deref()
            .ok_or_else(|| anyhow!("DATABASE_URL or SUPABASE_URL must be set"))?;
        let host = supabase_db_host(supabase_url)?;
        let mut options = PgConnectOptions::new()
            .host(&host)
            .port(5432)
            .database("postgres")
            .username("postgres");
        if let Some(password) = &self.supabase_service_role_key {
            options = options.password(password);
        }
        Ok(options)
    }
}

/// 从 Supabase 项目地址推导数据库主机名
fn supabase_db_host(url: &str) -> Result<String> {
    let host = url.trim_start_matches("https://").trim_start_matches("http://");
    let project_ref = host.split('.').next().unwrap_or_default();
    if project_ref.is_empty() {
        return Err(anyhow!("无效的 SUPABASE_URL: {}", url));
    }
    Ok(format!("db.{}.supabase.co", project_ref))
}

fn parse_switch(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "" | "0" | "false" | "no" => Ok(false),
        _ => Err(format!("无效的开关值: {}", s)),
    }
}
