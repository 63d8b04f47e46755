use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use indicatif::ProgressStyle;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokenizers::Tokenizer;

/// 获取 Hugging Face 上的模型仓库
pub fn hf_repo(model: &str, revision: &str) -> Result<ApiRepo> {
    let api = Api::new()?;
    Ok(api.repo(Repo::with_revision(model.to_string(), RepoType::Model, revision.to_string())))
}

/// 下载（或从缓存读取）仓库中的文件
pub fn hf_get_file(repo: &ApiRepo, filename: &str) -> Result<PathBuf> {
    Ok(repo.get(filename)?)
}

pub fn load_tokenizer(repo: &ApiRepo) -> Result<Tokenizer> {
    let path = hf_get_file(repo, "tokenizer.json")?;
    Tokenizer::from_file(path).map_err(anyhow::Error::msg)
}

/// 优先使用 CUDA，失败时回退到 CPU
pub fn pick_device(cpu: bool) -> Device {
    if cpu {
        return Device::Cpu;
    }
    Device::new_cuda(0).unwrap_or(Device::Cpu)
}

/// 当前可用内存，单位为字节，无法获取时返回 0
pub fn available_memory() -> u64 {
    let system = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    system.available_memory()
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len:5} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}
