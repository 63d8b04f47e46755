use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip;
use futures::StreamExt;
use image::DynamicImage;
use image::imageops::FilterType;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tokio::task::spawn_blocking;
use utoipa::ToSchema;

use crate::config::ModelOptions;
use crate::drive::ImageDescriptor;
use crate::{metrics, utils};

/// 单张图片描述失败时使用的占位描述
pub const FALLBACK_CAPTION: &str = "Unable to generate caption";

/// 解码起始 token
const BOS_TOKEN_ID: u32 = 30522;
/// 解码结束 token（[SEP]）
const SEP_TOKEN_ID: u32 = 102;

/// 带描述的图片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaptionedImage {
    pub file_name: String,
    pub drive_link: String,
    pub caption: String,
}

/// 图片描述模型
pub trait CaptionModel: Send + Sync {
    fn caption(&self, image: &DynamicImage) -> Result<String>;
}

/// 基于 candle 的 BLIP 图片描述模型
pub struct BlipCaptioner {
    // 文本解码器带有 KV 缓存，同一时间只能处理一张图片
    model: Mutex<blip::BlipForConditionalGeneration>,
    tokenizer: Tokenizer,
    device: Device,
    max_tokens: usize,
    /// 输入图片边长
    image_size: usize,
}

impl BlipCaptioner {
    pub fn load(opts: &ModelOptions) -> Result<Self> {
        info!("加载图片描述模型: {}", opts.caption_model);
        let device = utils::pick_device(opts.cpu);
        let repo = utils::hf_repo(&opts.caption_model, &opts.caption_revision)?;
        let config_file = utils::hf_get_file(&repo, "config.json")?;
        let weights_file = utils::hf_get_file(&repo, "model.safetensors")?;
        let tokenizer = utils::load_tokenizer(&repo)?;

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(config_file)?)?;
        let config = blip_config(&raw);
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], DType::F32, &device)? };
        let model = blip::BlipForConditionalGeneration::new(&config, vb)?;
        info!("图片描述模型加载完成");

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            device,
            max_tokens: opts.caption_max_tokens,
            image_size: config.vision_config.image_size,
        })
    }

    /// 缩放并归一化为 (3, size, size) 的张量
    fn image_tensor(&self, image: &DynamicImage) -> Result<Tensor> {
        let size = self.image_size;
        let img = image
            .resize_to_fill(size as u32, size as u32, FilterType::Triangle)
            .to_rgb8()
            .into_raw();
        let data = Tensor::from_vec(img, (size, size, 3), &Device::Cpu)?.permute((2, 0, 1))?;
        let mean = Tensor::new(&[0.48145466f32, 0.4578275, 0.40821073], &Device::Cpu)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&[0.26862954f32, 0.2613026, 0.2757771], &Device::Cpu)?.reshape((3, 1, 1))?;
        let data = (data.to_dtype(DType::F32)? / 255.)?.broadcast_sub(&mean)?.broadcast_div(&std)?;
        Ok(data.to_device(&self.device)?)
    }

    /// 贪心解码，返回不含起始 token 的序列
    fn generate(
        &self,
        model: &mut blip::BlipForConditionalGeneration,
        image_embeds: &Tensor,
    ) -> Result<Vec<u32>> {
        // 不设置温度时总是取概率最大的 token
        let mut logits_processor = LogitsProcessor::new(0, None, None);
        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..self.max_tokens {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = model.text_decoder().forward(&input_ids, image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }
        token_ids.remove(0);
        Ok(token_ids)
    }
}

impl CaptionModel for BlipCaptioner {
    fn caption(&self, image: &DynamicImage) -> Result<String> {
        let image = self.image_tensor(image)?;
        let mut model = self.model.lock().map_err(|_| anyhow!("caption model lock poisoned"))?;

        let image_embeds = model.vision_model().forward(&image.unsqueeze(0)?)?;
        let result = self.generate(&mut model, &image_embeds);
        model.reset_kv_cache();
        let token_ids = result?;

        let caption = self.tokenizer.decode(&token_ids, true).map_err(anyhow::Error::msg)?;
        Ok(caption.trim().to_string())
    }
}

/// 以 large 的结构为基础，用仓库 config.json 中给出的尺寸覆盖
///
/// config.json 会省略取默认值的字段，不能直接反序列化
fn blip_config(raw: &serde_json::Value) -> blip::Config {
    let size = |section: Option<&str>, key: &str| {
        let section = match section {
            Some(name) => raw.get(name)?,
            None => raw,
        };
        section.get(key)?.as_u64().map(|n| n as usize)
    };

    let mut config = blip::Config::image_captioning_large();
    let vision = &mut config.vision_config;
    for (key, field) in [
        ("hidden_size", &mut vision.hidden_size),
        ("intermediate_size", &mut vision.intermediate_size),
        ("num_hidden_layers", &mut vision.num_hidden_layers),
        ("num_attention_heads", &mut vision.num_attention_heads),
        ("image_size", &mut vision.image_size),
        ("patch_size", &mut vision.patch_size),
    ] {
        if let Some(n) = size(Some("vision_config"), key) {
            *field = n;
        }
    }

    let text = &mut config.text_config;
    // 文本解码器的交叉注意力作用在视觉特征上
    text.encoder_hidden_size = config.vision_config.hidden_size;
    for (key, field) in [
        ("vocab_size", &mut text.vocab_size),
        ("hidden_size", &mut text.hidden_size),
        ("encoder_hidden_size", &mut text.encoder_hidden_size),
        ("intermediate_size", &mut text.intermediate_size),
        ("num_hidden_layers", &mut text.num_hidden_layers),
        ("num_attention_heads", &mut text.num_attention_heads),
        ("max_position_embeddings", &mut text.max_position_embeddings),
    ] {
        if let Some(n) = size(Some("text_config"), key) {
            *field = n;
        }
    }

    if let Some(n) = size(None, "projection_dim") {
        config.projection_dim = n;
    }
    if let Some(n) = size(None, "image_text_hidden_size") {
        config.image_text_hidden_size = n;
    }
    config
}

/// 下载图片并生成描述
pub struct CaptionService {
    http: reqwest::Client,
    model: Arc<dyn CaptionModel>,
    concurrency: usize,
}

impl CaptionService {
    pub fn new(model: Arc<dyn CaptionModel>, timeout: Duration, concurrency: usize) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, model, concurrency: concurrency.max(1) })
    }

    /// 为每张图片生成描述，输出顺序与输入一致
    ///
    /// 单张图片失败只会使该图片得到 [`FALLBACK_CAPTION`]，不影响其他图片
    pub async fn caption_images(&self, images: &[ImageDescriptor]) -> Vec<CaptionedImage> {
        let total = images.len();
        futures::stream::iter(images.to_vec().into_iter().enumerate())
            .map(|(idx, image)| async move {
                info!("处理图片 {}/{}: {}", idx + 1, total, image.file_name);
                let caption = match self.caption_one(&image.direct_link).await {
                    Ok(caption) => {
                        metrics::inc_caption_generated();
                        caption
                    }
                    Err(e) => {
                        warn!("生成描述失败 {}: {e:#}", image.direct_link);
                        metrics::inc_caption_fallback();
                        FALLBACK_CAPTION.to_string()
                    }
                };
                CaptionedImage { file_name: image.file_name, drive_link: image.drive_link, caption }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn caption_one(&self, url: &str) -> Result<String> {
        let bytes = self.http.get(url).send().await?.error_for_status()?.bytes().await?;
        let model = self.model.clone();
        spawn_blocking(move || {
            let image = image::load_from_memory(&bytes)?;
            model.caption(&image)
        })
        .await?
    }
}
