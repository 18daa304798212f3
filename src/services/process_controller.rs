use std::collections::{HashMap, HashSet};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use regex::{Captures, Regex};

use crate::error::{OrchestratorError, Result};
use crate::models::{Instance, InstanceStatus, Resource, ResourceType, Template};
use crate::services::procfs_scanner::ProcfsScanner;
use crate::services::resource_registry::ResourceRegistry;
use crate::state::{AppState, AppStateInner};

lazy_static! {
    /// 命令中的裸 `%token` 占位符
    static ref TOKEN_RE: Regex = Regex::new(r"%(\w+)").expect("valid token regex");
    /// `${name}` 变量占位符
    static ref VAR_RE: Regex = Regex::new(r"\$\{(\w+)\}").expect("valid var regex");
}

/// 草稿分配被并发占用时的最多尝试次数
const START_ATTEMPTS: u32 = 3;

/// 进程控制参数
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// SIGTERM 之后的轮询次数
    pub stop_grace_polls: u32,
    pub stop_poll_interval: Duration,
    /// 监控模式下检查进程存活的间隔
    pub monitor_poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stop_grace_polls: 20,
            stop_poll_interval: Duration::from_millis(100),
            monitor_poll_interval: Duration::from_secs(2),
        }
    }
}

/// 实例生命周期：stopped -> starting -> running -> stopping -> stopped，
/// 启动失败时进入 error
#[derive(Clone)]
pub struct ProcessController {
    state: AppState,
    registry: ResourceRegistry,
    scanner: Arc<ProcfsScanner>,
    config: ControllerConfig,
}

impl ProcessController {
    pub fn new(state: AppState, registry: ResourceRegistry, scanner: Arc<ProcfsScanner>) -> Self {
        Self::with_config(state, registry, scanner, ControllerConfig::default())
    }

    pub fn with_config(
        state: AppState,
        registry: ResourceRegistry,
        scanner: Arc<ProcfsScanner>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            state,
            registry,
            scanner,
            config,
        }
    }

    /// 按模板 ID 启动
    pub fn start_from_template(
        &self,
        template_id: &str,
        name: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Instance> {
        let template = self
            .state
            .lock()
            .templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::TemplateNotFound(template_id.to_string()))?;
        self.start_process(&template, name, vars)
    }

    /// 从模板创建实例并启动
    ///
    /// 资源探测在锁外对状态草稿进行，实例名先以 starting 占位；
    /// 回到锁内后复核草稿分配的值，被并发占用则重新分配。
    /// 任一资源分配或 spawn 失败都会释放本实例已占用的全部资源，
    /// 实例以 error 状态保留在表中。
    pub fn start_process(
        &self,
        template: &Template,
        name: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Instance> {
        {
            let mut guard = self.state.lock();
            if guard.instances.contains_key(name) {
                return Err(OrchestratorError::InstanceAlreadyExists(name.to_string()));
            }
            let mut placeholder = Instance::new(name, &template.id);
            placeholder.status = InstanceStatus::Starting;
            guard.instances.insert(name.to_string(), placeholder);
        }

        let mut attempt = 1;
        loop {
            let mut draft = self.state.snapshot();
            let mut inst = Instance::new(name, &template.id);
            let mut prepared = self.prepare(&mut draft, template, vars, &mut inst);

            let mut guard = self.state.lock();
            merge_counters(&mut guard, &draft.counters);

            let still_starting = guard
                .instances
                .get(name)
                .is_some_and(|stored| stored.status == InstanceStatus::Starting);
            if !still_starting {
                return Err(OrchestratorError::InstanceNotFound(name.to_string()));
            }

            if prepared.is_ok() {
                if let Some((rtype, value)) = first_claimed(&guard, &inst.resources) {
                    if attempt < START_ATTEMPTS {
                        log::debug!(
                            "{}={} of '{}' was claimed concurrently, retrying",
                            rtype,
                            value,
                            name
                        );
                        attempt += 1;
                        continue;
                    }
                    prepared = Err(OrchestratorError::ResourceUnavailable { rtype, value });
                }
            }

            let outcome = prepared.and_then(|()| {
                for (rtype, value) in &inst.resources {
                    guard.claim_resource(rtype, value, name);
                }
                spawn_command(&inst.command, inst.resources.get("workdir").map(String::as_str))
            });

            let child = match outcome {
                Ok(child) => child,
                Err(e) => {
                    guard.release_resources_for_owner(name);
                    inst.resources.clear();
                    inst.mark_error(e.to_string());
                    guard.instances.insert(name.to_string(), inst);
                    drop(guard);
                    log::warn!("Failed to start instance '{}': {}", name, e);
                    self.state.persist();
                    return Err(e);
                }
            };

            let pid = child.id() as i32;
            inst.mark_running(pid);
            inst.managed = true;
            // 记录的是编排器自身的工作目录
            if let Ok(cwd) = std::env::current_dir() {
                inst.cwd = cwd.display().to_string();
            }
            guard.instances.insert(name.to_string(), inst.clone());
            drop(guard);

            log::info!("Started instance '{}' (PID {}): {}", name, pid, inst.command);
            self.state.persist();
            self.spawn_reaper(name.to_string(), child);
            return Ok(inst);
        }
    }

    /// 在状态草稿上分配资源并完成插值，不触碰共享状态
    fn prepare(
        &self,
        draft: &mut AppStateInner,
        template: &Template,
        vars: &HashMap<String, String>,
        inst: &mut Instance,
    ) -> Result<()> {
        let mut final_vars = template.vars.clone();
        final_vars.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        for rtype in &template.resources {
            let requested = final_vars.get(rtype).map(String::as_str);
            let value = self.registry.allocate_resource(draft, rtype, requested)?;
            draft.claim_resource(rtype, &value, &inst.name);
            inst.resources.insert(rtype.clone(), value.clone());
            final_vars.insert(rtype.clone(), value);
        }

        let command = interpolate(&template.command, &final_vars);
        inst.command = self.resolve_tokens(draft, inst, &command)?;

        if let Some(action) = template.action.as_deref().filter(|a| !a.is_empty()) {
            let mut action_vars = final_vars;
            action_vars.extend(inst.resources.iter().map(|(k, v)| (k.clone(), v.clone())));
            inst.action = interpolate(action, &action_vars);
        }
        Ok(())
    }

    /// 每个不同的 `%token` 视为计数器资源，只分配一次，所有出现位置共用同一个值
    fn resolve_tokens(
        &self,
        state: &mut AppStateInner,
        inst: &mut Instance,
        command: &str,
    ) -> Result<String> {
        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut seen = HashSet::new();
        let tokens: Vec<String> = TOKEN_RE
            .captures_iter(command)
            .map(|caps| caps[1].to_string())
            .filter(|token| seen.insert(token.clone()))
            .collect();

        for token in tokens {
            let value = match inst.resources.get(&token) {
                Some(value) => value.clone(),
                None => {
                    let value = self.registry.allocate_resource(state, &token, None)?;
                    state.claim_resource(&token, &value, &inst.name);
                    inst.resources.insert(token.clone(), value.clone());
                    value
                }
            };
            resolved.insert(token, value);
        }

        Ok(TOKEN_RE
            .replace_all(command, |caps: &Captures| {
                resolved
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned())
    }

    /// 停止实例所在的整个进程组：SIGTERM，限时轮询，仍存活则 SIGKILL
    pub fn stop_process(&self, name: &str) -> Result<()> {
        let pid = {
            let mut guard = self.state.lock();
            let inst = guard
                .instances
                .get_mut(name)
                .ok_or_else(|| OrchestratorError::InstanceNotFound(name.to_string()))?;
            if inst.pid == 0 {
                return Err(OrchestratorError::ProcessNotRunning(name.to_string()));
            }
            inst.status = InstanceStatus::Stopping;
            inst.pid
        };

        log::info!("Stopping instance '{}' (PID {})", name, pid);
        let target = Pid::from_raw(pid);
        if let Err(e) = killpg(target, Signal::SIGTERM) {
            log::debug!("killpg({}) failed: {}, signalling the process only", pid, e);
            if let Err(e) = kill(target, Signal::SIGTERM) {
                if e != Errno::ESRCH {
                    log::warn!("Failed to send SIGTERM to {}: {}", pid, e);
                }
            }
        }

        for _ in 0..self.config.stop_grace_polls {
            if !self.scanner.is_running(pid) {
                break;
            }
            thread::sleep(self.config.stop_poll_interval);
        }

        if self.scanner.is_running(pid) {
            log::warn!("Instance '{}' ignored SIGTERM, sending SIGKILL", name);
            let _ = killpg(target, Signal::SIGKILL);
            let _ = kill(target, Signal::SIGKILL);
            thread::sleep(self.config.stop_poll_interval);
        }

        // 不是我们的子进程时会失败
        let _ = waitpid(target, Some(WaitPidFlag::WNOHANG));

        {
            let mut guard = self.state.lock();
            if let Some(inst) = guard.instances.get_mut(name) {
                if inst.pid == pid || inst.pid == 0 {
                    inst.mark_stopped();
                    inst.cpu_time = 0.0;
                }
            }
        }
        self.state.persist();
        log::info!("Stopped instance '{}'", name);
        Ok(())
    }

    /// 停止并释放资源（不打算重启）
    pub fn stop_and_release(&self, name: &str) -> Result<Instance> {
        self.stop_process(name)?;
        let inst = {
            let mut guard = self.state.lock();
            let released = guard.release_resources_for_owner(name);
            log::debug!("Released {} resources of '{}'", released, name);
            guard.instances.get(name).cloned()
        };
        self.state.persist();
        inst.ok_or_else(|| OrchestratorError::InstanceNotFound(name.to_string()))
    }

    /// 用已插值的命令重新启动一个 stopped 实例
    ///
    /// 先校验全部旧资源，再统一重新占用；任一校验失败则整体放弃。
    pub fn restart_process(&self, name: &str) -> Result<Instance> {
        let mut guard = self.state.lock();
        let inst = guard
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::InstanceNotFound(name.to_string()))?;
        if inst.status != InstanceStatus::Stopped {
            return Err(OrchestratorError::NotStopped {
                name: name.to_string(),
                status: inst.status.to_string(),
            });
        }

        let mut claims = Vec::with_capacity(inst.resources.len());
        for (key, value) in &inst.resources {
            let (rtype, rt) = resolve_type(&guard.types, key)
                .ok_or_else(|| OrchestratorError::ResourceTypeGone(key.clone()))?;
            if guard.is_claimed_by_other(rtype, value, name)
                || !self.registry.check_resource(rt, value)
            {
                return Err(OrchestratorError::ResourceUnavailable {
                    rtype: rtype.to_string(),
                    value: value.clone(),
                });
            }
            claims.push((rtype.to_string(), value.clone()));
        }
        for (rtype, value) in &claims {
            guard.claim_resource(rtype, value, name);
        }

        let spawned = spawn_command(
            &inst.command,
            inst.resources.get("workdir").map(String::as_str),
        );
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                guard.release_resources_for_owner(name);
                if let Some(stored) = guard.instances.get_mut(name) {
                    stored.mark_error(e.to_string());
                }
                drop(guard);
                log::warn!("Failed to restart instance '{}': {}", name, e);
                self.state.persist();
                return Err(e);
            }
        };

        let pid = child.id() as i32;
        let restarted = match guard.instances.get_mut(name) {
            Some(stored) => {
                stored.mark_running(pid);
                stored.managed = true;
                stored.error.clear();
                stored.clone()
            }
            None => inst,
        };
        drop(guard);

        log::info!("Restarted instance '{}' (PID {})", name, pid);
        self.state.persist();
        self.spawn_reaper(name.to_string(), child);
        Ok(restarted)
    }

    /// 把一个已在运行的进程纳入监控
    ///
    /// 监听端口记为 `tcpport`、`tcpport1`…，工作目录记为 `workdir`。
    /// 能发送信号 0 的进程视为可管理。
    pub fn monitor_process(&self, pid: i32, name: &str) -> Result<Instance> {
        if self.state.lock().instances.contains_key(name) {
            return Err(OrchestratorError::InstanceAlreadyExists(name.to_string()));
        }
        if !self.scanner.is_running(pid) {
            return Err(OrchestratorError::ProcessNotFound(pid));
        }
        let info = self.scanner.read_process_info(pid)?;
        if info.cmdline.is_empty() {
            return Err(OrchestratorError::ProcessNotFound(pid));
        }

        let mut inst = Instance::new(name, "");
        inst.command = info.cmdline.clone();
        inst.cwd = info.cwd.clone();
        inst.cpu_time = info.cpu_time;
        // 多个端口都按 tcpport 类型登记
        let mut claims = Vec::new();
        for (i, port) in info.ports.iter().enumerate() {
            let key = if i == 0 {
                "tcpport".to_string()
            } else {
                format!("tcpport{}", i)
            };
            inst.resources.insert(key, port.to_string());
            claims.push(("tcpport", port.to_string()));
        }
        if !info.cwd.is_empty() {
            inst.resources.insert("workdir".into(), info.cwd.clone());
            claims.push(("workdir", info.cwd.clone()));
        }
        inst.managed = kill(Pid::from_raw(pid), None::<Signal>).is_ok();
        inst.mark_running(pid);

        {
            let mut guard = self.state.lock();
            if guard.instances.contains_key(name) {
                return Err(OrchestratorError::InstanceAlreadyExists(name.to_string()));
            }
            for (rtype, value) in &claims {
                claim_unless_owned(&mut guard, rtype, value, name);
            }
            guard.instances.insert(name.to_string(), inst.clone());
        }

        log::info!(
            "Monitoring PID {} as '{}' (managed: {})",
            pid,
            name,
            inst.managed
        );
        self.state.persist();
        self.spawn_poller(name.to_string(), pid);
        Ok(inst)
    }

    /// 按 PID 导入为不受管的运行实例
    pub fn import_process(&self, pid: i32, name: &str) -> Result<Instance> {
        self.ensure_name_free(name)?;
        let discovered = self.scanner.discover_process(pid)?;
        let inst = discovered_instance(name, pid, &discovered.info.cmdline);
        self.insert_imported(inst, None)
    }

    /// 导入监听指定端口的进程，端口记为 `tcpport`
    pub fn import_process_on_port(&self, port: u16, name: &str) -> Result<Instance> {
        self.ensure_name_free(name)?;
        let discovered = self.scanner.discover_process_on_port(port)?;
        let mut inst =
            discovered_instance(name, discovered.info.pid, &discovered.info.cmdline);
        inst.resources.insert("tcpport".into(), port.to_string());
        self.insert_imported(inst, Some(port))
    }

    fn ensure_name_free(&self, name: &str) -> Result<()> {
        if self.state.lock().instances.contains_key(name) {
            return Err(OrchestratorError::InstanceAlreadyExists(name.to_string()));
        }
        Ok(())
    }

    fn insert_imported(&self, inst: Instance, port: Option<u16>) -> Result<Instance> {
        {
            let mut guard = self.state.lock();
            if guard.instances.contains_key(&inst.name) {
                return Err(OrchestratorError::InstanceAlreadyExists(inst.name.clone()));
            }
            if let Some(port) = port {
                claim_unless_owned(&mut guard, "tcpport", &port.to_string(), &inst.name);
            }
            guard.instances.insert(inst.name.clone(), inst.clone());
        }
        log::info!("Imported PID {} as '{}'", inst.pid, inst.name);
        self.state.persist();
        Ok(inst)
    }

    /// 删除实例：运行中先停止，再释放资源
    pub fn delete_instance(&self, name: &str) -> Result<()> {
        let running = self
            .state
            .lock()
            .instances
            .get(name)
            .map(Instance::is_running)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(name.to_string()))?;

        if running {
            match self.stop_process(name) {
                Ok(()) | Err(OrchestratorError::ProcessNotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }

        {
            let mut guard = self.state.lock();
            guard.release_resources_for_owner(name);
            guard.instances.remove(name);
        }
        log::info!("Deleted instance '{}'", name);
        self.state.persist();
        Ok(())
    }

    /// 在后台执行实例的 action
    pub fn execute_action(&self, name: &str) -> Result<String> {
        let action = self
            .state
            .lock()
            .instances
            .get(name)
            .map(|inst| inst.action.clone())
            .ok_or_else(|| OrchestratorError::InstanceNotFound(name.to_string()))?;
        if action.trim().is_empty() {
            return Err(OrchestratorError::NoAction(name.to_string()));
        }

        // `&` 让 sh 立即返回，status() 顺便回收它
        Command::new("sh")
            .arg("-c")
            .arg(format!("{} &", action))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(OrchestratorError::ActionFailed)?;

        log::info!("Executed action for '{}': {}", name, action);
        Ok(action)
    }

    /// 等待子进程退出并回收；若实例仍指向这个 PID 则标记为 stopped
    fn spawn_reaper(&self, name: String, mut child: Child) {
        let state = self.state.clone();
        let pid = child.id() as i32;
        let spawned = thread::Builder::new()
            .name(format!("reap-{}", pid))
            .spawn(move || {
                match child.wait() {
                    Ok(status) => log::info!("Instance '{}' (PID {}) exited: {}", name, pid, status),
                    Err(e) => log::debug!("wait on PID {} failed: {}", pid, e),
                }
                mark_exited(&state, &name, pid);
            });
        if let Err(e) = spawned {
            log::warn!("Failed to spawn reaper for PID {}: {}", pid, e);
        }
    }

    /// 轮询监控的进程，消失后标记为 stopped
    fn spawn_poller(&self, name: String, pid: i32) {
        let state = self.state.clone();
        let scanner = self.scanner.clone();
        let interval = self.config.monitor_poll_interval;
        let spawned = thread::Builder::new()
            .name(format!("poll-{}", pid))
            .spawn(move || loop {
                thread::sleep(interval);
                if !scanner.is_running(pid) {
                    log::info!("Monitored instance '{}' (PID {}) is gone", name, pid);
                    mark_exited(&state, &name, pid);
                    break;
                }
            });
        if let Err(e) = spawned {
            log::warn!("Failed to spawn poller for PID {}: {}", pid, e);
        }
    }
}

fn mark_exited(state: &AppState, name: &str, pid: i32) {
    let changed = {
        let mut guard = state.lock();
        match guard.instances.get_mut(name) {
            Some(inst) if inst.pid == pid => {
                inst.mark_stopped();
                true
            }
            _ => false,
        }
    };
    if changed {
        state.persist();
    }
}

/// 登记占用，但不抢其它实例已持有的 (type, value)
fn claim_unless_owned(state: &mut AppStateInner, rtype: &str, value: &str, owner: &str) {
    if state.is_claimed_by_other(rtype, value, owner) {
        log::debug!("{}={} is held by another instance, not claimed by '{}'", rtype, value, owner);
        return;
    }
    state.claim_resource(rtype, value, owner);
}

/// 资源键对应的类型；`tcpport1` 这类带序号的键归到去掉序号后的类型
fn resolve_type<'a>(
    types: &'a HashMap<String, ResourceType>,
    key: &str,
) -> Option<(&'a str, &'a ResourceType)> {
    types
        .get_key_value(key)
        .or_else(|| types.get_key_value(key.trim_end_matches(|c: char| c.is_ascii_digit())))
        .map(|(name, rt)| (name.as_str(), rt))
}

/// 草稿推进过的计数器只进不退
fn merge_counters(state: &mut AppStateInner, counters: &HashMap<String, u32>) {
    for (rtype, next) in counters {
        let current = state.counters.entry(rtype.clone()).or_insert(*next);
        *current = (*current).max(*next);
    }
}

/// 第一个已被登记占用的 (type, value)
fn first_claimed(
    state: &AppStateInner,
    resources: &HashMap<String, String>,
) -> Option<(String, String)> {
    resources
        .iter()
        .find(|(rtype, value)| state.resources.contains_key(&Resource::key(rtype, value)))
        .map(|(rtype, value)| (rtype.clone(), value.clone()))
}

fn discovered_instance(name: &str, pid: i32, cmdline: &str) -> Instance {
    let mut inst = Instance::new(name, "discovered");
    inst.command = cmdline.to_string();
    inst.managed = false;
    inst.mark_running(pid);
    inst
}

/// 把 `${name}` 替换为变量值，单遍扫描，替换结果不再展开；未知变量原样保留
pub fn interpolate(pattern: &str, vars: &HashMap<String, String>) -> String {
    VAR_RE
        .replace_all(pattern, |caps: &Captures| {
            vars.get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// 以空白切分命令并在新的进程组中启动
fn spawn_command(command: &str, workdir: Option<&str>) -> Result<Child> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or(OrchestratorError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(parts)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    if let Some(dir) = workdir.filter(|dir| !dir.is_empty()) {
        cmd.current_dir(dir);
    }

    cmd.spawn().map_err(|source| OrchestratorError::SpawnFailure {
        command: command.to_string(),
        source,
    })
}
