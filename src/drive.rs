use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use log::{debug, error};
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use yup_oauth2::authenticator::DefaultAuthenticator;
use yup_oauth2::{ServiceAccountAuthenticator, parse_service_account_key};

use crate::config::DriveOptions;

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";

const IMAGE_QUERY: &str = "(mimeType contains 'image/jpeg' or mimeType contains 'image/png' or mimeType contains 'image/jpg')";

/// 按顺序尝试的文件夹链接格式
static FOLDER_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"folders/([A-Za-z0-9_-]+)").expect("failed to build regex"),
        Regex::new(r"id=([A-Za-z0-9_-]+)").expect("failed to build regex"),
    ]
});

/// Drive 中的一张图片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    pub file_name: String,
    #[serde(default)]
    pub file_id: String,
    /// 网页查看地址
    pub drive_link: String,
    /// 直接下载地址
    pub direct_link: String,
}

impl ImageDescriptor {
    pub fn from_file_id(file_id: &str, file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            file_id: file_id.to_string(),
            drive_link: format!("https://drive.google.com/file/d/{}/view", file_id),
            direct_link: format!("https://drive.google.com/uc?export=view&id={}", file_id),
        }
    }
}

/// 从文件夹链接中提取文件夹 ID
pub fn extract_folder_id(drive_link: &str) -> Result<&str> {
    FOLDER_PATTERNS
        .iter()
        .find_map(|re| re.captures(drive_link).and_then(|caps| caps.get(1)))
        .map(|m| m.as_str())
        .ok_or_else(|| anyhow!("Invalid Google Drive folder link"))
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
}

enum DriveAuth {
    ServiceAccount(Box<DefaultAuthenticator>),
    Token(String),
}

/// Drive v3 REST 客户端
pub struct DriveClient {
    http: reqwest::Client,
    api_url: String,
    auth: DriveAuth,
}

impl DriveClient {
    /// 根据配置创建客户端，缺少凭据时返回错误
    pub async fn new(opts: &DriveOptions) -> Result<Self> {
        let auth = match (&opts.drive_access_token, &opts.google_credentials_json) {
            (Some(token), _) => DriveAuth::Token(token.clone()),
            (None, Some(json)) => {
                let key = parse_service_account_key(json)
                    .context("invalid GOOGLE_APPLICATION_CREDENTIALS_JSON")?;
                let auth = ServiceAccountAuthenticator::builder(key).build().await?;
                DriveAuth::ServiceAccount(Box::new(auth))
            }
            (None, None) => {
                return Err(anyhow!(
                    "Missing environment variable: GOOGLE_APPLICATION_CREDENTIALS_JSON"
                ));
            }
        };
        Ok(Self::with_auth(&opts.drive_api_url, auth))
    }

    /// 使用已有的 access token 创建客户端
    pub fn with_token(api_url: &str, token: impl Into<String>) -> Self {
        Self::with_auth(api_url, DriveAuth::Token(token.into()))
    }

    fn with_auth(api_url: &str, auth: DriveAuth) -> Self {
        Self { http: reqwest::Client::new(), api_url: api_url.trim_end_matches('/').to_string(), auth }
    }

    async fn access_token(&self) -> Result<String> {
        match &self.auth {
            DriveAuth::Token(token) => Ok(token.clone()),
            DriveAuth::ServiceAccount(auth) => {
                let token = auth.token(&[DRIVE_SCOPE]).await?;
                token
                    .token()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("service account returned no access token"))
            }
        }
    }

    /// 列出文件夹中的所有图片
    pub async fn list_images(&self, drive_link: &str) -> Result<Vec<ImageDescriptor>> {
        let folder_id = extract_folder_id(drive_link)?;
        self.list_folder(folder_id).await.map_err(|e| {
            error!("获取 Drive 图片失败: {e:#}");
            anyhow!("Failed to fetch from Google Drive API: {e:#}")
        })
    }

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<ImageDescriptor>> {
        let query = format!("'{}' in parents and {}", folder_id, IMAGE_QUERY);
        let token = self.access_token().await?;

        debug!("查询 Drive 文件夹: {}", folder_id);
        let response = self
            .http
            .get(format!("{}/files", self.api_url))
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id, name, webViewLink, webContentLink)"),
                ("pageSize", "1000"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{}: {}", status, body));
        }

        let list: FileList = response.json().await?;
        Ok(list.files.iter().map(|f| ImageDescriptor::from_file_id(&f.id, &f.name)).collect())
    }
}
