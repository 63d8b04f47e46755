use anyhow::Result;
use clap::Parser;
use indicatif::ProgressBar;
use log::info;
use tokio::task::spawn_blocking;

use crate::Opts;
use crate::caption::{CaptionService, FALLBACK_CAPTION};
use crate::cli::SubCommandExtend;
use crate::config::{DatabaseOptions, DriveOptions, ModelOptions};
use crate::db::PhotoStore;
use crate::drive::DriveClient;
use crate::registry::{HubModelLoader, ModelLoader};
use crate::utils::pb_style;

#[derive(Parser, Debug, Clone)]
pub struct ImportCommand {
    #[command(flatten)]
    pub models: ModelOptions,
    #[command(flatten)]
    pub drive: DriveOptions,
    #[command(flatten)]
    pub database: DatabaseOptions,
    /// Drive 文件夹链接
    pub drive_link: String,
    /// 每批处理的图片数量，每批写入一次数据库
    #[arg(long, value_name = "SIZE", default_value_t = 16)]
    pub batch_size: usize,
}

impl SubCommandExtend for ImportCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let drive = DriveClient::new(&self.drive).await?;
        let store = PhotoStore::new(&self.database)?;

        let images = drive.list_images(&self.drive_link).await?;
        info!("文件夹中共有 {} 张图片", images.len());
        if images.is_empty() {
            return Ok(());
        }

        info!("正在加载模型");
        let loader = HubModelLoader { opts: self.models.clone() };
        let (captioner, embedder) = spawn_blocking(move || -> Result<_> {
            Ok((loader.load_captioner()?, loader.load_embedder()?))
        })
        .await??;
        let service = CaptionService::new(
            captioner,
            self.models.fetch_timeout(),
            self.models.fetch_concurrency,
        )?;

        let pb = ProgressBar::new(images.len() as u64).with_style(pb_style());
        let mut stored = 0;
        let mut failed = 0;
        for chunk in images.chunks(self.batch_size.max(1)) {
            let captions = service.caption_images(chunk).await;
            failed += captions.iter().filter(|c| c.caption == FALLBACK_CAPTION).count();
            stored += store.store(embedder.clone(), &captions).await?;
            if let Some(last) = chunk.last() {
                pb.set_message(last.file_name.clone());
            }
            pb.inc(chunk.len() as u64);
        }
        pb.finish_with_message("导入完成");

        info!("写入 {} 条记录，{} 张图片描述生成失败", stored, failed);
        Ok(())
    }
}
