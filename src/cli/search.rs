use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::debug;
use tokio::task::spawn_blocking;

use crate::Opts;
use crate::cli::SubCommandExtend;
use crate::config::{DatabaseOptions, ModelOptions};
use crate::db::{DEFAULT_SEARCH_LIMIT, PhotoStore, SearchResult};
use crate::embedding;
use crate::registry::{HubModelLoader, ModelLoader};

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub models: ModelOptions,
    #[command(flatten)]
    pub database: DatabaseOptions,
    /// 自然语言查询
    pub query: String,
    /// 返回结果数量
    #[arg(long, value_name = "N", default_value_t = DEFAULT_SEARCH_LIMIT)]
    pub count: usize,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let store = PhotoStore::new(&self.database)?;
        let loader = HubModelLoader { opts: self.models.clone() };
        let embedder = spawn_blocking(move || loader.load_embedder()).await??;

        let vector = embedding::embed_blocking(embedder, self.query.clone()).await?;
        let result = store.search(vector, self.count.max(1)).await?;
        debug!("查询 {:?} 返回 {} 条结果", self.query, result.len());

        print_result(&result, self)
    }
}

fn print_result(result: &[SearchResult], opts: &SearchCommand) -> Result<()> {
    match opts.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for r in result {
                println!(
                    "{:.2}\t{}\t{}",
                    r.similarity,
                    r.drive_link,
                    r.caption.as_deref().unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone)]
pub enum OutputFormat {
    Json,
    Table,
}
