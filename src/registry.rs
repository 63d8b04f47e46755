use std::sync::Arc;

use anyhow::{Result, anyhow};
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock, watch};
use tokio::task::spawn_blocking;
use utoipa::ToSchema;

use crate::caption::{BlipCaptioner, CaptionModel, CaptionService};
use crate::config::{DatabaseOptions, DriveOptions, LoadOptions, ModelOptions};
use crate::db::PhotoStore;
use crate::drive::DriveClient;
use crate::embedding::{MiniLmEmbedder, TextEmbedder};
use crate::utils;

/// 模型加载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Uninitialized,
    Loading,
    Ready,
}

/// 触发加载的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// 已启动新的加载任务
    Started,
    AlreadyLoading,
    AlreadyReady,
    /// 配置禁止加载模型
    Disabled,
}

/// 负责创建模型，加载过程在阻塞线程中执行
pub trait ModelLoader: Send + Sync + 'static {
    fn load_captioner(&self) -> Result<Arc<dyn CaptionModel>>;
    fn load_embedder(&self) -> Result<Arc<dyn TextEmbedder>>;
}

/// 从 Hugging Face 加载 BLIP 和 MiniLM
pub struct HubModelLoader {
    pub opts: ModelOptions,
}

impl ModelLoader for HubModelLoader {
    fn load_captioner(&self) -> Result<Arc<dyn CaptionModel>> {
        Ok(Arc::new(BlipCaptioner::load(&self.opts)?))
    }

    fn load_embedder(&self) -> Result<Arc<dyn TextEmbedder>> {
        Ok(Arc::new(MiniLmEmbedder::load(&self.opts)?))
    }
}

/// 单个模型的句柄和加载状态
struct ModelSlot<T: ?Sized> {
    handle: RwLock<Option<Arc<T>>>,
    state: watch::Sender<LoadState>,
}

impl<T: ?Sized + Send + Sync + 'static> ModelSlot<T> {
    fn new() -> Self {
        let (state, _) = watch::channel(LoadState::Uninitialized);
        Self { handle: RwLock::new(None), state }
    }

    async fn get(&self) -> Option<Arc<T>> {
        self.handle.read().await.clone()
    }

    fn is_ready(&self) -> bool {
        *self.state.borrow() == LoadState::Ready
    }

    /// 未加载的模型进入 Loading，已加载的保持 Ready
    fn mark_loading(&self) {
        self.state.send_if_modified(|state| {
            if *state == LoadState::Uninitialized {
                *state = LoadState::Loading;
                true
            } else {
                false
            }
        });
    }

    fn reset(&self) {
        self.state.send_if_modified(|state| {
            if *state == LoadState::Loading {
                *state = LoadState::Uninitialized;
                true
            } else {
                false
            }
        });
    }

    async fn wait(&self) -> LoadState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| *state != LoadState::Loading).await {
            Ok(state) => *state,
            Err(_) => *self.state.borrow(),
        }
    }

    /// 在阻塞线程中加载模型，已加载时直接返回
    async fn load<F>(&self, name: &str, load: F)
    where
        F: FnOnce() -> Result<Arc<T>> + Send + 'static,
    {
        if self.get().await.is_some() {
            return;
        }
        match spawn_blocking(load).await {
            Ok(Ok(model)) => {
                *self.handle.write().await = Some(model);
                self.state.send_replace(LoadState::Ready);
                info!("{}加载完成", name);
            }
            Ok(Err(e)) => {
                error!("{}加载失败: {e:#}", name);
                self.reset();
            }
            Err(e) => {
                error!("{}加载任务异常退出: {e}", name);
                self.reset();
            }
        }
    }
}

/// 服务注册表，持有所有组件的句柄
pub struct ServiceRegistry {
    load: LoadOptions,
    models_opts: ModelOptions,
    drive_opts: DriveOptions,
    db_opts: DatabaseOptions,
    loader: Arc<dyn ModelLoader>,
    captioner: ModelSlot<dyn CaptionModel>,
    embedder: ModelSlot<dyn TextEmbedder>,
    /// 整体状态，同一时间只有一个加载任务
    state: watch::Sender<LoadState>,
    drive: OnceCell<Arc<DriveClient>>,
    store: OnceCell<Arc<PhotoStore>>,
    /// 可用内存探测，测试中可以替换
    memory_probe: fn() -> u64,
}

pub struct RegistryBuilder {
    load: LoadOptions,
    models: ModelOptions,
    drive: DriveOptions,
    db: DatabaseOptions,
    loader: Option<Arc<dyn ModelLoader>>,
    memory_probe: fn() -> u64,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            load: LoadOptions::default(),
            models: ModelOptions::default(),
            drive: DriveOptions::default(),
            db: DatabaseOptions::default(),
            loader: None,
            memory_probe: utils::available_memory,
        }
    }

    pub fn load_options(mut self, opts: LoadOptions) -> Self {
        self.load = opts;
        self
    }

    pub fn model_options(mut self, opts: ModelOptions) -> Self {
        self.models = opts;
        self
    }

    pub fn drive_options(mut self, opts: DriveOptions) -> Self {
        self.drive = opts;
        self
    }

    pub fn database_options(mut self, opts: DatabaseOptions) -> Self {
        self.db = opts;
        self
    }

    /// 替换模型加载器，默认从 Hugging Face 加载
    pub fn loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn memory_probe(mut self, probe: fn() -> u64) -> Self {
        self.memory_probe = probe;
        self
    }

    pub fn build(self) -> Arc<ServiceRegistry> {
        let loader: Arc<dyn ModelLoader> = match self.loader {
            Some(loader) => loader,
            None => Arc::new(HubModelLoader { opts: self.models.clone() }),
        };
        let (state, _) = watch::channel(LoadState::Uninitialized);
        Arc::new(ServiceRegistry {
            load: self.load,
            models_opts: self.models,
            drive_opts: self.drive,
            db_opts: self.db,
            loader,
            captioner: ModelSlot::new(),
            embedder: ModelSlot::new(),
            state,
            drive: OnceCell::new(),
            store: OnceCell::new(),
            memory_probe: self.memory_probe,
        })
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn state(&self) -> LoadState {
        *self.state.borrow()
    }

    /// 两个模型都已加载
    pub async fn is_ready(&self) -> bool {
        self.captioner.get().await.is_some() && self.embedder.get().await.is_some()
    }

    pub async fn captioner(&self) -> Option<Arc<dyn CaptionModel>> {
        self.captioner.get().await
    }

    pub async fn embedder(&self) -> Option<Arc<dyn TextEmbedder>> {
        self.embedder.get().await
    }

    /// 创建使用当前描述模型的服务
    pub async fn caption_service(&self) -> Result<Option<CaptionService>> {
        let Some(model) = self.captioner().await else {
            return Ok(None);
        };
        let service = CaptionService::new(
            model,
            self.models_opts.fetch_timeout(),
            self.models_opts.fetch_concurrency,
        )?;
        Ok(Some(service))
    }

    /// 启动后台加载，已在加载中或已就绪时不做任何事
    pub async fn trigger(self: &Arc<Self>) -> TriggerOutcome {
        if self.load.skip_model_load {
            return TriggerOutcome::Disabled;
        }

        let mut outcome = TriggerOutcome::Started;
        self.state.send_if_modified(|state| match state {
            LoadState::Uninitialized => {
                *state = LoadState::Loading;
                self.captioner.mark_loading();
                self.embedder.mark_loading();
                true
            }
            LoadState::Loading => {
                outcome = TriggerOutcome::AlreadyLoading;
                false
            }
            LoadState::Ready => {
                outcome = TriggerOutcome::AlreadyReady;
                false
            }
        });

        if outcome == TriggerOutcome::Started {
            let registry = self.clone();
            tokio::spawn(async move {
                let worker = tokio::spawn(registry.clone().run_load());
                // 加载任务 panic 时状态不能停留在 Loading
                if let Err(e) = worker.await {
                    error!("模型加载任务异常退出: {e}");
                    registry.captioner.reset();
                    registry.embedder.reset();
                    registry.state.send_replace(LoadState::Uninitialized);
                }
            });
        }
        outcome
    }

    /// 等待当前的加载任务结束，返回结束后的状态
    pub async fn wait_for_load(&self) -> LoadState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| *state != LoadState::Loading).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// 获取写入路径所需的向量模型，未加载时触发加载，只等待向量模型完成
    pub async fn embedder_for_write(self: &Arc<Self>) -> Result<Arc<dyn TextEmbedder>> {
        if let Some(embedder) = self.embedder().await {
            return Ok(embedder);
        }
        if self.trigger().await == TriggerOutcome::Disabled {
            return Err(anyhow!("embedding model loading is disabled"));
        }
        self.embedder.wait().await;
        self.embedder().await.ok_or_else(|| anyhow!("embedding model failed to load"))
    }

    /// Drive 客户端，首次使用时创建
    pub async fn drive(&self) -> Result<Arc<DriveClient>> {
        self.drive
            .get_or_try_init(|| async { Ok(Arc::new(DriveClient::new(&self.drive_opts).await?)) })
            .await
            .cloned()
    }

    /// 数据库存储，首次使用时根据配置创建
    pub async fn store(&self) -> Result<Arc<PhotoStore>> {
        self.store
            .get_or_try_init(|| async { Ok(Arc::new(PhotoStore::new(&self.db_opts)?)) })
            .await
            .cloned()
    }

    async fn run_load(self: Arc<Self>) {
        let free = (self.memory_probe)();
        info!("加载模型前的可用内存: {} 字节", free);
        if free != 0 && free < self.load.min_free_bytes {
            warn!("可用内存不足（{} 字节），跳过模型加载", free);
            self.captioner.reset();
            self.embedder.reset();
            self.state.send_replace(LoadState::Uninitialized);
            return;
        }

        // 向量模型较小，先加载，写入和搜索不必等待描述模型
        let loader = self.loader.clone();
        self.embedder.load("文本向量模型", move || loader.load_embedder()).await;
        let loader = self.loader.clone();
        self.captioner.load("图片描述模型", move || loader.load_captioner()).await;

        // 任一模型失败时回到 Uninitialized，下次触发只加载缺少的模型
        let state = if self.captioner.is_ready() && self.embedder.is_ready() {
            LoadState::Ready
        } else {
            LoadState::Uninitialized
        };
        self.state.send_replace(state);

        if let Err(e) = self.store().await {
            warn!("数据库未配置: {e:#}");
        }
        if let Err(e) = self.drive().await {
            warn!("Drive 客户端未配置: {e:#}");
        }
    }
}
