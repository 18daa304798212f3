use crate::models::{Instance, Resource, ResourceType, Template};
use crate::services::persistence::StatePersistence;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// 全部共享状态；实例、资源与计数器之间的不变式跨字段，只能整体加锁
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppStateInner {
    #[serde(default)]
    pub instances: HashMap<String, Instance>,
    #[serde(default)]
    pub templates: HashMap<String, Template>,
    /// "type:value" -> Resource
    #[serde(default)]
    pub resources: HashMap<String, Resource>,
    /// 资源类型 -> 下一个候选值
    #[serde(default)]
    pub counters: HashMap<String, u32>,
    #[serde(default)]
    pub types: HashMap<String, ResourceType>,
}

impl AppStateInner {
    pub fn with_defaults() -> Self {
        Self {
            templates: Template::defaults(),
            types: ResourceType::defaults(),
            ..Default::default()
        }
    }

    /// 已被实例占用的 PID
    pub fn tracked_pids(&self) -> Vec<i32> {
        self.instances
            .values()
            .filter(|inst| inst.pid > 0)
            .map(|inst| inst.pid)
            .collect()
    }
}

/// 共享状态句柄：一把互斥锁保护全部数据，外加持久化协作者
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Mutex<AppStateInner>>,
    persistence: Arc<dyn StatePersistence>,
    write_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(inner: AppStateInner, persistence: Arc<dyn StatePersistence>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            persistence,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn load(persistence: Arc<dyn StatePersistence>) -> anyhow::Result<Self> {
        let inner = persistence.load()?;
        Ok(Self::new(inner, persistence))
    }

    pub fn lock(&self) -> MutexGuard<'_, AppStateInner> {
        // 后台线程 panic 不应让整个编排器不可用
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> AppStateInner {
        self.lock().clone()
    }

    /// 写入持久化层。调用时不得持有状态锁。
    pub fn persist(&self) -> bool {
        let _writer = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot = self.snapshot();
        match self.persistence.save(&snapshot) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to persist state: {:#}", e);
                false
            }
        }
    }
}

#[cfg(test)]
pub fn test_state(inner: AppStateInner) -> (AppState, Arc<crate::services::persistence::MemoryStore>) {
    let store = Arc::new(crate::services::persistence::MemoryStore::default());
    (AppState::new(inner, store.clone()), store)
}
