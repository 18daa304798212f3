use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::models::instance::now_secs;
use crate::models::{Instance, InstanceStatus, ProcessInfo};
use crate::services::procfs_scanner::ProcfsScanner;
use crate::state::AppState;

/// 匹配引擎所需的进程表视图
pub trait ProcessTable: Send + Sync {
    fn is_running(&self, pid: i32) -> bool;
    fn read_process_info(&self, pid: i32) -> Result<ProcessInfo>;
    fn list_processes(&self) -> Result<Vec<ProcessInfo>>;
}

impl ProcessTable for ProcfsScanner {
    fn is_running(&self, pid: i32) -> bool {
        ProcfsScanner::is_running(self, pid)
    }

    fn read_process_info(&self, pid: i32) -> Result<ProcessInfo> {
        ProcfsScanner::read_process_info(self, pid)
    }

    fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        ProcfsScanner::list_processes(self)
    }
}

/// 判断一个存活进程是否就是某个已停止实例
pub trait ProcessMatcher: Send + Sync {
    fn matches(&self, instance: &Instance, candidate: &ProcessInfo) -> bool;
}

/// 按可执行文件名匹配（默认策略）
///
/// 两个同名且端口相同（或都没有端口）的无关进程无法区分。
pub struct BasenameMatcher;

impl ProcessMatcher for BasenameMatcher {
    fn matches(&self, instance: &Instance, candidate: &ProcessInfo) -> bool {
        let expected = instance.expected_basename();
        !expected.is_empty() && (candidate.name == expected || candidate.exe_basename() == expected)
    }
}

/// 按规范化后的可执行文件路径匹配；命令首个 token 不是绝对路径时退回文件名匹配
pub struct ExecutablePathMatcher;

impl ProcessMatcher for ExecutablePathMatcher {
    fn matches(&self, instance: &Instance, candidate: &ProcessInfo) -> bool {
        let Some(program) = instance.command.split_whitespace().next() else {
            return false;
        };
        if !program.starts_with('/') {
            return BasenameMatcher.matches(instance, candidate);
        }
        let expected = std::fs::canonicalize(program).unwrap_or_else(|_| program.into());
        let actual = candidate.exe.trim_end_matches(" (deleted)");
        !actual.is_empty() && Path::new(actual) == expected
    }
}

/// 一次匹配的结果
#[derive(Debug, Default, Clone, Serialize)]
pub struct MatchReport {
    /// 进程消失而转为 stopped 的实例
    pub stopped: Vec<String>,
    /// 重新认领到存活进程的实例与 PID
    pub matched: Vec<(String, i32)>,
}

impl MatchReport {
    pub fn transitions(&self) -> usize {
        self.stopped.len() + self.matched.len()
    }
}

/// 对账引擎：让实例记录的 PID/状态与真实进程表保持一致
pub struct MatchingEngine {
    table: Arc<dyn ProcessTable>,
    matcher: Box<dyn ProcessMatcher>,
}

impl MatchingEngine {
    pub fn new(table: Arc<dyn ProcessTable>) -> Self {
        Self::with_matcher(table, Box::new(BasenameMatcher))
    }

    pub fn with_matcher(table: Arc<dyn ProcessTable>, matcher: Box<dyn ProcessMatcher>) -> Self {
        Self { table, matcher }
    }

    /// 一轮对账，整轮持有状态锁，结束后持久化一次
    pub fn match_and_update_instances(&self, state: &AppState) -> Result<MatchReport> {
        let mut report = MatchReport::default();
        let outcome = {
            let mut guard = state.lock();
            self.reconcile(&mut guard.instances, &mut report)
        };
        state.persist();

        for name in &report.stopped {
            log::info!("Instance '{}' is no longer running", name);
        }
        for (name, pid) in &report.matched {
            log::info!("Matched instance '{}' to running PID {}", name, pid);
        }
        outcome.map(|()| report)
    }

    fn reconcile(
        &self,
        instances: &mut std::collections::HashMap<String, Instance>,
        report: &mut MatchReport,
    ) -> Result<()> {
        // 1. 运行中的实例：刷新 CPU 时间或标记停止
        for inst in instances.values_mut() {
            if inst.status != InstanceStatus::Running {
                continue;
            }
            if self.table.is_running(inst.pid) {
                if let Ok(info) = self.table.read_process_info(inst.pid) {
                    inst.cpu_time = info.cpu_time;
                }
            } else {
                inst.mark_stopped();
                inst.cpu_time = 0.0;
                report.stopped.push(inst.name.clone());
            }
        }

        // 2. 枚举未被跟踪的用户进程；僵尸进程下一轮会被判定为已退出，不参与认领
        let tracked: HashSet<i32> = instances
            .values()
            .filter(|inst| inst.pid > 0)
            .map(|inst| inst.pid)
            .collect();
        let candidates: Vec<ProcessInfo> = self
            .table
            .list_processes()?
            .into_iter()
            .filter(|p| !tracked.contains(&p.pid) && !p.zombie && !p.looks_like_kernel_thread())
            .collect();

        // 3. 已停止的实例尝试认领候选进程，同一轮内一个 PID 只归一个实例
        let mut claimed: HashSet<i32> = HashSet::new();
        let mut names: Vec<String> = instances
            .values()
            .filter(|inst| inst.status == InstanceStatus::Stopped)
            .filter(|inst| !inst.expected_basename().is_empty())
            .map(|inst| inst.name.clone())
            .collect();
        names.sort();

        for name in names {
            let Some(inst) = instances.get_mut(&name) else {
                continue;
            };
            let expected_ports = inst.expected_ports();
            let found = candidates.iter().find(|candidate| {
                !claimed.contains(&candidate.pid)
                    && self.matcher.matches(inst, candidate)
                    && expected_ports.iter().all(|port| candidate.ports.contains(port))
            });

            if let Some(candidate) = found {
                inst.pid = candidate.pid;
                inst.status = InstanceStatus::Running;
                inst.started = now_secs();
                inst.cpu_time = candidate.cpu_time;
                claimed.insert(candidate.pid);
                report.matched.push((name, candidate.pid));
            }
        }

        Ok(())
    }
}
