use anyhow::Result;
use clap::Parser;
use log::info;

use crate::Opts;
use crate::cli::SubCommandExtend;
use crate::config::DatabaseOptions;
use crate::db::PhotoStore;

#[derive(Parser, Debug, Clone)]
pub struct MigrateCommand {
    #[command(flatten)]
    pub database: DatabaseOptions,
}

impl SubCommandExtend for MigrateCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        PhotoStore::new(&self.database)?.migrate().await?;
        info!("数据库迁移完成");
        Ok(())
    }
}
