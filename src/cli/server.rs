use anyhow::{Result, anyhow};
use clap::Parser;
use log::{error, info};
use prometheus::{BasicAuthentication, labels};
use tokio::net::TcpListener;
use tokio::task::spawn_blocking;
use tokio::time::{Duration, sleep};

use crate::Opts;
use crate::cli::SubCommandExtend;
use crate::config::{DatabaseOptions, DriveOptions, LoadOptions, ModelOptions};
use crate::registry::{ServiceRegistry, TriggerOutcome};
use crate::server;

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub load: LoadOptions,
    #[command(flatten)]
    pub models: ModelOptions,
    #[command(flatten)]
    pub drive: DriveOptions,
    #[command(flatten)]
    pub database: DatabaseOptions,
    /// 监听地址
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// 监听端口
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,
    /// 启动前执行数据库迁移
    #[arg(long)]
    pub migrate: bool,
    /// prometheus 主动推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME")]
    pub prometheus_instance: Option<String>,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH")]
    pub prometheus_auth: Option<String>,
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let registry = ServiceRegistry::builder()
            .load_options(self.load.clone())
            .model_options(self.models.clone())
            .drive_options(self.drive.clone())
            .database_options(self.database.clone())
            .build();

        if self.migrate {
            registry.store().await?.migrate().await?;
        }

        match registry.trigger().await {
            TriggerOutcome::Disabled => info!("SKIP_MODEL_LOAD 已设置，不加载模型"),
            _ => info!("开始在后台加载模型"),
        }

        let addr = format!("{}:{}", self.host, self.port);

        if let Some(url) = self.prometheus_push.clone() {
            let instance = self.prometheus_instance.clone().unwrap_or_else(|| addr.clone());
            let auth = self.prometheus_auth.as_deref().map(parse_auth).transpose()?;
            tokio::spawn(push_metrics_loop(url, instance, auth));
        }

        let app = server::create_app(server::AppState::new(registry));

        // 启动服务器
        info!("服务器启动：http://{}", addr);
        let listener = TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

fn parse_auth(s: &str) -> Result<(String, String)> {
    let (username, password) =
        s.split_once(':').ok_or_else(|| anyhow!("prometheus 认证信息格式应为 username:password"))?;
    Ok((username.to_string(), password.to_string()))
}

async fn push_metrics_loop(url: String, instance: String, auth: Option<(String, String)>) {
    loop {
        let metric_families = prometheus::gather();
        let url = url.clone();
        let instance = instance.clone();
        let auth = auth.clone();
        let r = spawn_blocking(move || {
            prometheus::push_metrics(
                "drive_photo_search",
                labels! {
                    "instance".to_string() => instance,
                },
                &url,
                metric_families,
                auth.map(|(username, password)| BasicAuthentication { username, password }),
            )
        })
        .await;
        match r {
            Ok(Err(e)) => error!("推送指标失败: {e}"),
            Err(e) => error!("推送指标任务异常: {e}"),
            Ok(Ok(())) => {}
        }
        sleep(Duration::from_secs(30)).await;
    }
}
