use anyhow::Context;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::models::ResourceType;
use crate::state::AppStateInner;

/// 持久化协作者：存储格式与位置不属于编排核心
pub trait StatePersistence: Send + Sync {
    fn load(&self) -> anyhow::Result<AppStateInner>;
    fn save(&self, state: &AppStateInner) -> anyhow::Result<()>;
}

/// 以 JSON 文件保存状态
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 默认位置 ~/.vibeprocess/state.json
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".vibeprocess")
            .join("state.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatePersistence for JsonFileStore {
    fn load(&self) -> anyhow::Result<AppStateInner> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No state file at {}, using defaults", self.path.display());
                return Ok(AppStateInner::with_defaults());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        let mut state: AppStateInner = match serde_json::from_str(&data) {
            Ok(state) => state,
            Err(e) => {
                log::warn!(
                    "State file {} is not valid ({}), using defaults",
                    self.path.display(),
                    e
                );
                return Ok(AppStateInner::with_defaults());
            }
        };

        // 新增的内置类型合并进旧文件
        for (name, rt) in ResourceType::defaults() {
            state.types.entry(name).or_insert(rt);
        }
        Ok(state)
    }

    fn save(&self, state: &AppStateInner) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let data = serde_json::to_vec_pretty(state).context("Failed to serialize state")?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)
                .with_context(|| format!("Failed to open {}", tmp.display()))?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// 测试用的内存存储，记录保存次数
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    saved: std::sync::Mutex<Vec<AppStateInner>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn save_count(&self) -> usize {
        self.saved.lock().unwrap().len()
    }

    pub fn last_saved(&self) -> Option<AppStateInner> {
        self.saved.lock().unwrap().last().cloned()
    }
}

#[cfg(test)]
impl StatePersistence for MemoryStore {
    fn load(&self) -> anyhow::Result<AppStateInner> {
        Ok(self.last_saved().unwrap_or_else(AppStateInner::with_defaults))
    }

    fn save(&self, state: &AppStateInner) -> anyhow::Result<()> {
        self.saved.lock().unwrap().push(state.clone());
        Ok(())
    }
}
