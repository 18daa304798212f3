use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::models::{Resource, ResourceType};
use crate::state::AppStateInner;

/// 资源可用性探测：返回 true 表示可用
pub trait AvailabilityProbe: Send + Sync {
    fn is_available(&self, check: &str, value: &str) -> bool;
}

/// 通过 `sh -c` 执行检查命令；只看退出码，0 = 已占用，非 0 = 可用
pub struct ShellProbe;

impl AvailabilityProbe for ShellProbe {
    fn is_available(&self, check: &str, value: &str) -> bool {
        let script = check.replace("${value}", value);
        let status = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) => !status.success(),
            Err(e) => {
                log::warn!("Failed to run resource check '{}': {}", script, e);
                true
            }
        }
    }
}

#[derive(Clone)]
pub struct ResourceRegistry {
    probe: Arc<dyn AvailabilityProbe>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::with_probe(Arc::new(ShellProbe))
    }

    pub fn with_probe(probe: Arc<dyn AvailabilityProbe>) -> Self {
        Self { probe }
    }

    /// 检查资源值是否可用；检查命令为空时总是可用。同步阻塞直到探测结束。
    pub fn check_resource(&self, rt: &ResourceType, value: &str) -> bool {
        if rt.check.is_empty() {
            return true;
        }
        self.probe.is_available(&rt.check, value)
    }

    /// 分配一个资源值（不登记占用，由调用方 claim）
    ///
    /// 计数器类型且未指定值时，从已存计数器（未设置时取 start）向上扫描到 end，
    /// 第一个可用值胜出，计数器推进到该值 + 1。仍被占用的值直接跳过。
    pub fn allocate_resource(
        &self,
        state: &mut AppStateInner,
        rtype: &str,
        requested: Option<&str>,
    ) -> Result<String> {
        let rt = state
            .types
            .get(rtype)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownResourceType(rtype.to_string()))?;

        let requested = requested.filter(|v| !v.is_empty());

        if rt.counter && requested.is_none() {
            let current = state
                .counters
                .get(rtype)
                .copied()
                .unwrap_or(rt.start)
                .max(rt.start);

            for candidate in current..=rt.end {
                let value = candidate.to_string();
                if state.resources.contains_key(&Resource::key(rtype, &value)) {
                    continue;
                }
                if self.check_resource(&rt, &value) {
                    state
                        .counters
                        .insert(rtype.to_string(), candidate.saturating_add(1));
                    log::debug!("Allocated {}={}", rtype, value);
                    return Ok(value);
                }
            }

            return Err(OrchestratorError::RangeExhausted {
                rtype: rtype.to_string(),
                start: rt.start,
                end: rt.end,
            });
        }

        let value = requested
            .ok_or_else(|| OrchestratorError::MissingExplicitValue(rtype.to_string()))?;

        let claimed = state.resources.contains_key(&Resource::key(rtype, value));
        if claimed || !self.check_resource(&rt, value) {
            return Err(OrchestratorError::ResourceUnavailable {
                rtype: rtype.to_string(),
                value: value.to_string(),
            });
        }

        Ok(value.to_string())
    }
}

impl AppStateInner {
    /// 登记资源占用；同一 (type, value) 只有一个所有者
    pub fn claim_resource(&mut self, rtype: &str, value: &str, owner: &str) {
        self.resources.insert(
            Resource::key(rtype, value),
            Resource {
                rtype: rtype.to_string(),
                value: value.to_string(),
                owner: owner.to_string(),
            },
        );
    }

    /// 释放某个实例拥有的全部资源，返回释放数量
    pub fn release_resources_for_owner(&mut self, owner: &str) -> usize {
        let before = self.resources.len();
        self.resources.retain(|_, res| res.owner != owner);
        before - self.resources.len()
    }

    /// (type, value) 是否被其它实例占用
    pub fn is_claimed_by_other(&self, rtype: &str, value: &str, owner: &str) -> bool {
        self.resources
            .get(&Resource::key(rtype, value))
            .is_some_and(|res| res.owner != owner)
    }

    pub fn resources_by_type(&self) -> std::collections::BTreeMap<String, Vec<Resource>> {
        let mut grouped: std::collections::BTreeMap<String, Vec<Resource>> = Default::default();
        for res in self.resources.values() {
            grouped.entry(res.rtype.clone()).or_default().push(res.clone());
        }
        for list in grouped.values_mut() {
            list.sort_by(|a, b| a.value.cmp(&b.value));
        }
        grouped
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// 只有列出的值被视为已占用，记录每次探测
    #[derive(Default)]
    pub struct FakeProbe {
        pub busy: Mutex<HashSet<String>>,
        pub probed: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        pub fn with_busy(values: &[&str]) -> Self {
            let probe = Self::default();
            probe
                .busy
                .lock()
                .unwrap()
                .extend(values.iter().map(|v| v.to_string()));
            probe
        }
    }

    impl AvailabilityProbe for FakeProbe {
        fn is_available(&self, _check: &str, value: &str) -> bool {
            self.probed.lock().unwrap().push(value.to_string());
            !self.busy.lock().unwrap().contains(value)
        }
    }

    fn state_with(types: &[ResourceType]) -> AppStateInner {
        let mut state = AppStateInner::default();
        for rt in types {
            state.types.insert(rt.name.clone(), rt.clone());
        }
        state
    }

    #[test]
    fn test_counter_range_then_exhausted() {
        let registry = ResourceRegistry::new();
        let mut state = state_with(&[ResourceType::counter("tcpport", "false ${value}", 3000, 3002)]);

        let got: Vec<String> = (0..3)
            .map(|_| registry.allocate_resource(&mut state, "tcpport", None).unwrap())
            .collect();
        assert_eq!(got, vec!["3000", "3001", "3002"]);

        let err = registry
            .allocate_resource(&mut state, "tcpport", None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RangeExhausted { start: 3000, end: 3002, .. }));
    }

    #[test]
    fn test_counter_skips_busy_values() {
        let probe = Arc::new(FakeProbe::with_busy(&["10", "11"]));
        let registry = ResourceRegistry::with_probe(probe.clone());
        let mut state = state_with(&[ResourceType::counter("slot", "probe ${value}", 10, 20)]);

        let value = registry.allocate_resource(&mut state, "slot", None).unwrap();
        assert_eq!(value, "12");
        assert_eq!(state.counters["slot"], 13);
        assert_eq!(*probe.probed.lock().unwrap(), vec!["10", "11", "12"]);
    }

    #[test]
    fn test_counter_resumes_from_stored_value() {
        let probe = Arc::new(FakeProbe::default());
        let registry = ResourceRegistry::with_probe(probe.clone());
        let mut state = state_with(&[ResourceType::counter("slot", "probe", 10, 20)]);
        state.counters.insert("slot".into(), 15);

        assert_eq!(registry.allocate_resource(&mut state, "slot", None).unwrap(), "15");

        // 低于 start 的旧计数器不会让分配越界
        state.counters.insert("slot".into(), 2);
        assert_eq!(registry.allocate_resource(&mut state, "slot", None).unwrap(), "10");
    }

    #[test]
    fn test_all_busy_is_exhausted() {
        let registry = ResourceRegistry::new();
        let mut state = state_with(&[ResourceType::counter("tcpport", "true", 5, 7)]);
        let err = registry
            .allocate_resource(&mut state, "tcpport", None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RangeExhausted { .. }));
        assert!(!state.counters.contains_key("tcpport"));
    }

    #[test]
    fn test_claimed_values_are_never_reused() {
        let registry = ResourceRegistry::with_probe(Arc::new(FakeProbe::default()));
        let mut state = state_with(&[ResourceType::counter("slot", "probe", 1, 3)]);
        state.claim_resource("slot", "1", "other");

        assert_eq!(registry.allocate_resource(&mut state, "slot", None).unwrap(), "2");
        let err = registry
            .allocate_resource(&mut state, "slot", Some("1"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceUnavailable { .. }));
    }

    #[test]
    fn test_unknown_type() {
        let registry = ResourceRegistry::new();
        let mut state = AppStateInner::default();
        let err = registry
            .allocate_resource(&mut state, "gpu", Some("0"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownResourceType(t) if t == "gpu"));
    }

    #[test]
    fn test_explicit_value_required() {
        let registry = ResourceRegistry::new();
        let mut state = state_with(&[ResourceType::explicit("dbfile", "test -f ${value}")]);
        let err = registry
            .allocate_resource(&mut state, "dbfile", None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingExplicitValue(_)));

        let err = registry
            .allocate_resource(&mut state, "dbfile", Some(""))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingExplicitValue(_)));
    }

    #[test]
    fn test_explicit_value_checked_by_shell_probe() {
        let dir = tempfile::TempDir::new().unwrap();
        let existing = dir.path().join("present.db");
        std::fs::write(&existing, b"").unwrap();
        let missing = dir.path().join("absent.db");

        let registry = ResourceRegistry::new();
        let mut state = state_with(&[ResourceType::explicit("dbfile", "test -f ${value}")]);

        let err = registry
            .allocate_resource(&mut state, "dbfile", existing.to_str())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceUnavailable { .. }));

        let value = registry
            .allocate_resource(&mut state, "dbfile", missing.to_str())
            .unwrap();
        assert_eq!(value, missing.to_str().unwrap());
    }

    #[test]
    fn test_requested_value_on_counter_type() {
        let registry = ResourceRegistry::with_probe(Arc::new(FakeProbe::default()));
        let mut state = state_with(&[ResourceType::counter("tcpport", "probe", 3000, 3010)]);
        let value = registry
            .allocate_resource(&mut state, "tcpport", Some("8080"))
            .unwrap();
        assert_eq!(value, "8080");
        assert!(!state.counters.contains_key("tcpport"));
    }

    #[test]
    fn test_empty_check_always_available() {
        let registry = ResourceRegistry::with_probe(Arc::new(FakeProbe::with_busy(&["/data"])));
        let rt = ResourceType::explicit("datadir", "");
        assert!(registry.check_resource(&rt, "/data"));
    }

    #[test]
    fn test_release_by_owner() {
        let mut state = AppStateInner::default();
        state.claim_resource("tcpport", "3000", "a");
        state.claim_resource("workdir", "/srv", "a");
        state.claim_resource("tcpport", "3001", "b");

        assert_eq!(state.release_resources_for_owner("a"), 2);
        assert_eq!(state.resources.len(), 1);
        assert!(state.is_claimed_by_other("tcpport", "3001", "a"));
        assert!(!state.is_claimed_by_other("tcpport", "3001", "b"));

        let grouped = state.resources_by_type();
        assert_eq!(grouped["tcpport"].len(), 1);
    }
}
