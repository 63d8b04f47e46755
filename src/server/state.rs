use std::sync::Arc;

use crate::registry::ServiceRegistry;

/// 应用状态
pub struct AppState {
    /// 模型与外部服务
    pub registry: Arc<ServiceRegistry>,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(registry: Arc<ServiceRegistry>) -> Arc<Self> {
        Arc::new(AppState { registry })
    }
}
