use std::sync::Arc;

use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::models::{ProcessInfo, ResourceType, Template};
use crate::services::{
    MatchReport, MatchingEngine, ProcessController, ProcfsScanner, ResourceRegistry,
    StatePersistence,
};
use crate::state::AppState;

/// 编排器各服务的装配，CLI 与 HTTP 层共用
#[derive(Clone)]
pub struct AppContext {
    pub state: AppState,
    pub scanner: Arc<ProcfsScanner>,
    pub controller: ProcessController,
    pub matching: Arc<MatchingEngine>,
    pub metrics: Arc<MetricsRegistry>,
}

impl AppContext {
    pub fn load(persistence: Arc<dyn StatePersistence>) -> anyhow::Result<Self> {
        let state = AppState::load(persistence)?;
        Self::with_state(state).map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))
    }

    pub fn with_state(state: AppState) -> prometheus::Result<Self> {
        let scanner = Arc::new(ProcfsScanner::new());
        let registry = ResourceRegistry::new();
        let controller = ProcessController::new(state.clone(), registry, scanner.clone());
        let matching = Arc::new(MatchingEngine::new(scanner.clone()));
        let metrics = Arc::new(MetricsRegistry::new()?);

        Ok(Self {
            state,
            scanner,
            controller,
            matching,
            metrics,
        })
    }

    /// 跑一轮对账；失败只记警告
    pub fn refresh(&self) -> Option<MatchReport> {
        match self.matching.match_and_update_instances(&self.state) {
            Ok(report) => Some(report),
            Err(e) => {
                log::warn!("Discovery failed: {}", e);
                None
            }
        }
    }

    /// 尚未被任何实例跟踪的进程
    pub fn discover(&self, ports_only: bool) -> Result<Vec<ProcessInfo>> {
        let tracked = self.state.lock().tracked_pids();
        self.scanner.discover_processes(&tracked, ports_only)
    }

    pub fn add_template(&self, template: Template) {
        log::info!("Saving template '{}'", template.id);
        self.state
            .lock()
            .templates
            .insert(template.id.clone(), template);
        self.state.persist();
    }

    /// 类型名统一转为小写
    pub fn add_resource_type(&self, mut rt: ResourceType) -> ResourceType {
        rt.name = rt.name.to_lowercase();
        log::info!("Saving resource type '{}'", rt.name);
        self.state.lock().types.insert(rt.name.clone(), rt.clone());
        self.state.persist();
        rt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{test_state, AppStateInner};

    #[test]
    fn test_catalogue_updates_persist() {
        let (state, store) = test_state(AppStateInner::with_defaults());
        let ctx = AppContext::with_state(state).unwrap();

        let rt = ctx.add_resource_type(ResourceType::counter("GPU", "", 0, 3));
        assert_eq!(rt.name, "gpu");
        assert!(ctx.state.lock().types.contains_key("gpu"));

        ctx.add_template(Template {
            id: "echo".into(),
            command: "echo %gpu".into(),
            ..Default::default()
        });
        assert_eq!(store.save_count(), 2);
        assert!(store.last_saved().unwrap().templates.contains_key("echo"));
    }

    #[test]
    fn test_discover_excludes_tracked_pids() {
        let (state, _store) = test_state(AppStateInner::default());
        let own = std::process::id() as i32;
        let mut inst = crate::models::Instance::new("me", "discovered");
        inst.mark_running(own);
        state.lock().instances.insert("me".into(), inst);

        let ctx = AppContext::with_state(state).unwrap();
        let found = ctx.discover(false).unwrap();
        assert!(found.iter().all(|p| p.pid != own));
        assert!(!found.is_empty());
    }
}
