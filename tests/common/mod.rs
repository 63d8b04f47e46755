#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use drive_photo_search::caption::{CaptionModel, CaptionedImage};
use drive_photo_search::config::LoadOptions;
use drive_photo_search::embedding::{EMBEDDING_DIM, TextEmbedder};
use drive_photo_search::registry::{ModelLoader, RegistryBuilder, ServiceRegistry};
use image::{DynamicImage, GenericImageView};

/// 以图片尺寸作为描述
pub struct FakeCaptioner;

impl CaptionModel for FakeCaptioner {
    fn caption(&self, image: &DynamicImage) -> Result<String> {
        Ok(format!("{}x{} image", image.width(), image.height()))
    }
}

pub struct FakeEmbedder;

impl TextEmbedder for FakeEmbedder {
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| fake_vector(t)).collect())
    }
}

/// 相同文本得到相同的单位向量
pub fn fake_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0f32; EMBEDDING_DIM];
    v[0] = 1.0;
    for (i, b) in text.bytes().enumerate() {
        v[(i * 31 + b as usize) % EMBEDDING_DIM] += b as f32 / 255.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

#[derive(Default)]
pub struct FakeLoader {
    pub captioner_calls: Arc<AtomicUsize>,
    pub embedder_calls: Arc<AtomicUsize>,
    /// 前 N 次加载描述模型会失败
    pub fail_first: usize,
    pub delay: Duration,
}

impl FakeLoader {
    pub fn failing(times: usize) -> Self {
        Self { fail_first: times, ..Default::default() }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }
}

impl ModelLoader for FakeLoader {
    fn load_captioner(&self) -> Result<Arc<dyn CaptionModel>> {
        let n = self.captioner_calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if n < self.fail_first {
            return Err(anyhow!("simulated load failure"));
        }
        Ok(Arc::new(FakeCaptioner))
    }

    fn load_embedder(&self) -> Result<Arc<dyn TextEmbedder>> {
        self.embedder_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeEmbedder))
    }
}

fn plenty_of_memory() -> u64 {
    u64::MAX
}

/// 使用假模型、内存充足的注册表
pub fn builder(loader: FakeLoader) -> RegistryBuilder {
    ServiceRegistry::builder().loader(Arc::new(loader)).memory_probe(plenty_of_memory)
}

pub fn registry(loader: FakeLoader) -> Arc<ServiceRegistry> {
    builder(loader).build()
}

pub fn disabled_registry() -> Arc<ServiceRegistry> {
    builder(FakeLoader::default())
        .load_options(LoadOptions { skip_model_load: true, ..Default::default() })
        .build()
}

pub async fn ready_registry() -> Arc<ServiceRegistry> {
    let registry = registry(FakeLoader::default());
    registry.trigger().await;
    registry.wait_for_load().await;
    registry
}

pub fn photo(link: &str, caption: &str) -> CaptionedImage {
    CaptionedImage {
        file_name: "photo.jpg".to_string(),
        drive_link: link.to_string(),
        caption: caption.to_string(),
    }
}

/// 4x3 的 PNG 图片
pub fn png_bytes() -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    DynamicImage::new_rgb8(4, 3)
        .write_to(&mut buf, image::ImageFormat::Png)
        .expect("failed to encode png");
    buf.into_inner()
}
