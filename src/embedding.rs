use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use log::info;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tokio::task::spawn_blocking;

use crate::config::ModelOptions;
use crate::utils;

/// all-MiniLM-L6-v2 的向量维度
pub const EMBEDDING_DIM: usize = 384;

/// 文本向量模型
pub trait TextEmbedder: Send + Sync {
    /// 向量维度
    fn dimension(&self) -> usize;

    /// 批量计算文本向量，返回顺序与输入一致
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| anyhow!("embedding model returned no vector"))
    }
}

/// 在阻塞线程池中批量计算向量
pub async fn embed_batch_blocking(
    embedder: Arc<dyn TextEmbedder>,
    texts: Vec<String>,
) -> Result<Vec<Vec<f32>>> {
    spawn_blocking(move || embedder.embed_batch(&texts)).await?
}

pub async fn embed_blocking(embedder: Arc<dyn TextEmbedder>, text: String) -> Result<Vec<f32>> {
    spawn_blocking(move || embedder.embed(&text)).await?
}

/// 基于 candle 的 sentence-transformers BERT 模型
pub struct MiniLmEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl MiniLmEmbedder {
    pub fn load(opts: &ModelOptions) -> Result<Self> {
        info!("加载文本向量模型: {}", opts.embedding_model);
        let device = utils::pick_device(opts.cpu);
        let repo = utils::hf_repo(&opts.embedding_model, &opts.embedding_revision)?;
        let config_file = utils::hf_get_file(&repo, "config.json")?;
        let weights_file = utils::hf_get_file(&repo, "model.safetensors")?;

        let raw = std::fs::read(config_file)?;
        let config: Config = serde_json::from_slice(&raw)?;
        let dimension = serde_json::from_slice::<serde_json::Value>(&raw)?["hidden_size"]
            .as_u64()
            .map_or(EMBEDDING_DIM, |n| n as usize);
        let mut tokenizer = utils::load_tokenizer(&repo)?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams { max_length: 256, ..Default::default() }))
            .map_err(anyhow::Error::msg)?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], DTYPE, &device)? };
        let model = BertModel::load(vb, &config)?;
        info!("文本向量模型加载完成");

        Ok(Self { model, tokenizer, device, dimension })
    }

    fn forward(&self, texts: &[String]) -> Result<Tensor> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(anyhow::Error::msg)?;

        let token_ids = encodings
            .iter()
            .map(|e| Ok(Tensor::new(e.get_ids(), &self.device)?))
            .collect::<Result<Vec<_>>>()?;
        let attention_mask = encodings
            .iter()
            .map(|e| Ok(Tensor::new(e.get_attention_mask(), &self.device)?))
            .collect::<Result<Vec<_>>>()?;

        let token_ids = Tensor::stack(&token_ids, 0)?;
        let attention_mask = Tensor::stack(&attention_mask, 0)?;
        let token_type_ids = token_ids.zeros_like()?;

        let hidden = self.model.forward(&token_ids, &token_type_ids, Some(&attention_mask))?;

        // 按 attention mask 做平均池化
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let pooled = summed.broadcast_div(&mask.sum(1)?)?;

        let norm = pooled.sqr()?.sum_keepdim(1)?.sqrt()?;
        Ok(pooled.broadcast_div(&norm)?)
    }
}

impl TextEmbedder for MiniLmEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let embeddings = self.forward(texts).context("failed to compute embeddings")?;
        Ok(embeddings.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }
}
