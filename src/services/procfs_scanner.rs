use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{sysconf, Pid, SysconfVar};
use serde::Serialize;

use crate::error::{OrchestratorError, Result};
use crate::models::process::is_kernel_thread;
use crate::models::ProcessInfo;

/// 端口映射缓存时间
pub const PORT_MAP_TTL: Duration = Duration::from_millis(500);
/// 进程信息缓存时间
pub const PROCESS_INFO_TTL: Duration = Duration::from_secs(1);
/// 父进程链最大长度
const MAX_CHAIN_HOPS: usize = 100;
/// /proc/net/tcp 中的 LISTEN 状态码
const TCP_LISTEN: &str = "0A";

const SHELL_NAMES: &[&str] = &["sh", "bash", "zsh", "fish", "dash", "ksh", "tcsh", "csh"];

pub fn is_shell(name: &str) -> bool {
    SHELL_NAMES.contains(&name)
}

#[derive(Default)]
struct PortCache {
    mapping: HashMap<u16, Vec<i32>>,
    refreshed: Option<Instant>,
}

struct CachedInfo {
    info: ProcessInfo,
    read_at: Instant,
}

/// 进程发现结果：目标进程、父进程链以及推断出的启动脚本
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredProcess {
    #[serde(flatten)]
    pub info: ProcessInfo,
    pub parent_chain: Vec<ProcessInfo>,
    pub launch_script: Option<ProcessInfo>,
}

/// 读取 /proc 文本格式的扫描器，端口映射与进程信息带 TTL 缓存
pub struct ProcfsScanner {
    root: PathBuf,
    clock_ticks: f64,
    port_ttl: Duration,
    info_ttl: Duration,
    port_cache: RwLock<PortCache>,
    info_cache: RwLock<HashMap<i32, CachedInfo>>,
}

impl Default for ProcfsScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsScanner {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let clock_ticks = match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(ticks)) if ticks > 0 => ticks as f64,
            _ => 100.0,
        };
        Self {
            root: root.into(),
            clock_ticks,
            port_ttl: PORT_MAP_TTL,
            info_ttl: PROCESS_INFO_TTL,
            port_cache: RwLock::new(PortCache::default()),
            info_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ttls(mut self, port_ttl: Duration, info_ttl: Duration) -> Self {
        self.port_ttl = port_ttl;
        self.info_ttl = info_ttl;
        self
    }

    /// 构建 端口 -> [PID] 映射；返回副本
    pub fn build_port_map(&self) -> Result<HashMap<u16, Vec<i32>>> {
        {
            let cache = self
                .port_cache
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(refreshed) = cache.refreshed {
                if refreshed.elapsed() < self.port_ttl {
                    return Ok(cache.mapping.clone());
                }
            }
        }

        // 阶段 A：LISTEN 套接字 inode -> 端口
        let mut inode_to_port = HashMap::new();
        for table in ["net/tcp", "net/tcp6"] {
            let path = self.root.join(table);
            match fs::read_to_string(&path) {
                Ok(contents) => inode_to_port.extend(parse_tcp_listeners(&contents)),
                Err(e) => log::debug!("Skipping {}: {}", path.display(), e),
            }
        }

        // 阶段 B：遍历每个进程的 fd，找到这些 inode 的持有者
        let mut mapping: HashMap<u16, Vec<i32>> = HashMap::new();
        for pid in self.list_pids()? {
            let fd_dir = self.pid_dir(pid).join("fd");
            let Ok(fds) = fs::read_dir(&fd_dir) else {
                continue;
            };
            for fd in fds.flatten() {
                let Ok(target) = fs::read_link(fd.path()) else {
                    continue;
                };
                let Some(inode) = socket_inode(&target.to_string_lossy()) else {
                    continue;
                };
                if let Some(port) = inode_to_port.get(&inode) {
                    let pids = mapping.entry(*port).or_default();
                    if !pids.contains(&pid) {
                        pids.push(pid);
                    }
                }
            }
        }
        for pids in mapping.values_mut() {
            pids.sort_unstable();
        }

        let mut cache = self
            .port_cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.mapping = mapping.clone();
        cache.refreshed = Some(Instant::now());

        Ok(mapping)
    }

    /// 读取单个进程的信息（带缓存）
    pub fn read_process_info(&self, pid: i32) -> Result<ProcessInfo> {
        {
            let cache = self
                .info_cache
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(cached) = cache.get(&pid) {
                if cached.read_at.elapsed() < self.info_ttl {
                    return Ok(cached.info.clone());
                }
            }
        }

        let dir = self.pid_dir(pid);
        if pid <= 0 || !dir.exists() {
            self.evict(pid);
            return Err(OrchestratorError::ProcessNotFound(pid));
        }

        let stat_path = dir.join("stat");
        let stat = match fs::read_to_string(&stat_path) {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.evict(pid);
                return Err(OrchestratorError::ProcessNotFound(pid));
            }
            Err(e) => return Err(OrchestratorError::procfs(stat_path, e)),
        };
        let stat = parse_stat(&stat).ok_or_else(|| {
            OrchestratorError::procfs(
                &stat_path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid stat format"),
            )
        })?;

        let cmdline = fs::read(dir.join("cmdline"))
            .map(|raw| join_nul_separated(&raw))
            .unwrap_or_default();

        let mut info = ProcessInfo {
            pid,
            ppid: stat.ppid,
            name: stat.name,
            cpu_time: stat.cpu_ticks as f64 / self.clock_ticks,
            kernel_thread: is_kernel_thread(pid, stat.ppid, &cmdline),
            zombie: stat.state == 'Z',
            cmdline,
            ..Default::default()
        };

        // 内核线程跳过昂贵的读取
        if !info.kernel_thread {
            info.exe = read_link_string(&dir.join("exe"));
            info.cwd = read_link_string(&dir.join("cwd"));
            if let Ok(raw) = fs::read(dir.join("environ")) {
                info.environ = parse_environ(&raw);
            }
            match self.get_ports_for_process(pid) {
                Ok(ports) => info.ports = ports,
                Err(e) => log::debug!("Cannot resolve ports for {}: {}", pid, e),
            }
        }

        let mut cache = self
            .info_cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(
            pid,
            CachedInfo {
                info: info.clone(),
                read_at: Instant::now(),
            },
        );

        Ok(info)
    }

    /// 进程是否存活；僵尸进程视为已退出
    pub fn is_running(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None::<Signal>) {
            Ok(()) | Err(Errno::EPERM) => {}
            Err(_) => return false,
        }
        match fs::read_to_string(self.pid_dir(pid).join("stat")) {
            Ok(stat) => parse_stat(&stat).map_or(true, |s| s.state != 'Z'),
            Err(_) => true,
        }
    }

    /// 从目标进程沿 PPID 向上走，读不到的祖先会截断链条
    pub fn get_parent_chain(&self, pid: i32) -> Vec<ProcessInfo> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = pid;

        while current > 0 && seen.insert(current) {
            let Ok(info) = self.read_process_info(current) else {
                break;
            };
            let ppid = info.ppid;
            chain.push(info);

            if current == 1 || ppid == 0 || chain.len() >= MAX_CHAIN_HOPS {
                break;
            }
            current = ppid;
        }

        chain
    }

    pub fn get_ports_for_process(&self, pid: i32) -> Result<Vec<u16>> {
        let mut ports: Vec<u16> = self
            .build_port_map()?
            .into_iter()
            .filter(|(_, pids)| pids.contains(&pid))
            .map(|(port, _)| port)
            .collect();
        ports.sort_unstable();
        Ok(ports)
    }

    pub fn get_processes_listening_on_port(&self, port: u16) -> Result<Vec<i32>> {
        Ok(self.build_port_map()?.remove(&port).unwrap_or_default())
    }

    pub fn discover_process(&self, pid: i32) -> Result<DiscoveredProcess> {
        let chain = self.get_parent_chain(pid);
        let Some(info) = chain.first().cloned() else {
            return Err(OrchestratorError::ProcessNotFound(pid));
        };
        let launch_script = find_launch_script(&chain).cloned();
        Ok(DiscoveredProcess {
            info,
            parent_chain: chain,
            launch_script,
        })
    }

    pub fn discover_process_on_port(&self, port: u16) -> Result<DiscoveredProcess> {
        let pids = self.get_processes_listening_on_port(port)?;
        let Some(pid) = pids.first() else {
            return Err(OrchestratorError::NoListenerOnPort(port));
        };
        self.discover_process(*pid)
    }

    /// 列出所有可读的进程，读不到的 PID 跳过
    pub fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut processes = Vec::new();
        for pid in self.list_pids()? {
            match self.read_process_info(pid) {
                Ok(info) => processes.push(info),
                Err(e) => log::debug!("Skipping pid {}: {}", pid, e),
            }
        }
        Ok(processes)
    }

    /// 列出未被跟踪的用户进程，可只保留有监听端口的
    pub fn discover_processes(&self, exclude: &[i32], ports_only: bool) -> Result<Vec<ProcessInfo>> {
        Ok(self
            .list_processes()?
            .into_iter()
            .filter(|p| !exclude.contains(&p.pid))
            .filter(|p| !p.zombie && !p.looks_like_kernel_thread())
            .filter(|p| !ports_only || !p.ports.is_empty())
            .collect())
    }

    fn list_pids(&self) -> Result<Vec<i32>> {
        let entries =
            fs::read_dir(&self.root).map_err(|e| OrchestratorError::procfs(&self.root, e))?;
        Ok(entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .collect())
    }

    fn pid_dir(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn evict(&self, pid: i32) {
        self.info_cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&pid);
    }
}

/// 在父进程链中找"启动脚本"：第一个父进程是 shell 的条目；
/// 否则取最外层既不是 PID 1 也不叫 systemd 的条目
pub fn find_launch_script(chain: &[ProcessInfo]) -> Option<&ProcessInfo> {
    for pair in chain.windows(2) {
        let parent = &pair[1];
        if is_shell(&parent.name) || is_shell(parent.exe_basename()) {
            return Some(&pair[0]);
        }
    }
    chain
        .iter()
        .rev()
        .find(|p| p.pid != 1 && p.name != "systemd")
}

#[derive(Debug, PartialEq)]
struct StatFields {
    name: String,
    state: char,
    ppid: i32,
    cpu_ticks: u64,
}

/// 解析 /proc/<pid>/stat：`pid (comm) state ppid ...`
/// comm 可能包含空格或括号，所以以最后一个 ')' 为锚点
fn parse_stat(stat: &str) -> Option<StatFields> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close < open {
        return None;
    }
    let name = stat[open + 1..close].to_string();
    let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    let ppid = fields.get(1)?.parse().ok()?;
    // utime、stime 是第 14、15 个字段，去掉 pid 与 comm 后下标为 11、12
    let utime: u64 = fields.get(11).and_then(|v| v.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|v| v.parse().ok()).unwrap_or(0);
    Some(StatFields {
        name,
        state,
        ppid,
        cpu_ticks: utime + stime,
    })
}

/// 解析 /proc/net/tcp{,6}，返回 LISTEN 行的 inode -> 本地端口
fn parse_tcp_listeners(contents: &str) -> HashMap<u64, u16> {
    let mut listeners = HashMap::new();
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[3] != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = fields[1].rsplit_once(':') else {
            continue;
        };
        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        let Ok(inode) = fields[9].parse::<u64>() else {
            continue;
        };
        if inode != 0 {
            listeners.insert(inode, port);
        }
    }
    listeners
}

fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

fn join_nul_separated(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .split('\0')
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

fn parse_environ(raw: &[u8]) -> HashMap<String, String> {
    String::from_utf8_lossy(raw)
        .split('\0')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn read_link_string(path: &Path) -> String {
    fs::read_link(path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    const TCP_HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n";

    fn stat_line(pid: i32, name: &str, state: char, ppid: i32, utime: u64, stime: u64) -> String {
        format!(
            "{pid} ({name}) {state} {ppid} {pid} {pid} 0 -1 4194560 100 0 0 0 {utime} {stime} 0 0 20 0 1 0 100 1000 100\n"
        )
    }

    struct FakeProc {
        dir: TempDir,
    }

    impl FakeProc {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("net")).unwrap();
            fs::write(dir.path().join("net/tcp"), TCP_HEADER).unwrap();
            fs::write(dir.path().join("net/tcp6"), TCP_HEADER).unwrap();
            // 非数字目录应被忽略
            fs::create_dir_all(dir.path().join("self")).unwrap();
            Self { dir }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn add(&self, pid: i32, name: &str, ppid: i32, argv: &[&str]) -> PathBuf {
            let pdir = self.root().join(pid.to_string());
            fs::create_dir_all(pdir.join("fd")).unwrap();
            fs::write(pdir.join("stat"), stat_line(pid, name, 'S', ppid, 250, 50)).unwrap();
            let mut cmdline = argv.join("\0");
            if !argv.is_empty() {
                cmdline.push('\0');
            }
            fs::write(pdir.join("cmdline"), cmdline).unwrap();
            fs::write(pdir.join("environ"), "HOME=/root\0PATH=/bin:/usr/bin\0EMPTY=\0").unwrap();
            pdir
        }

        fn add_exe(&self, pid: i32, exe: &str, cwd: &str) {
            let pdir = self.root().join(pid.to_string());
            symlink(exe, pdir.join("exe")).unwrap();
            symlink(cwd, pdir.join("cwd")).unwrap();
        }

        fn add_socket(&self, pid: i32, fd: u32, inode: u64) {
            let link = self.root().join(pid.to_string()).join("fd").join(fd.to_string());
            symlink(format!("socket:[{inode}]"), link).unwrap();
        }

        fn set_tcp(&self, table: &str, rows: &[(&str, &str, u64)]) {
            let mut contents = TCP_HEADER.to_string();
            for (i, (local, st, inode)) in rows.iter().enumerate() {
                contents.push_str(&format!(
                    "   {i}: {local} 00000000:0000 {st} 00000000:00000000 00:00000000 00000000  1000        0 {inode} 1 0000000000000000 100 0 0 10 0\n"
                ));
            }
            fs::write(self.root().join("net").join(table), contents).unwrap();
        }

        fn scanner(&self) -> ProcfsScanner {
            ProcfsScanner::with_root(self.root())
        }
    }

    #[test]
    fn test_parse_stat_with_parens_in_name() {
        let stat = "1234 (my (weird) proc) R 77 1234 1234 0 -1 0 0 0 0 0 300 120 0 0\n";
        let fields = parse_stat(stat).unwrap();
        assert_eq!(fields.name, "my (weird) proc");
        assert_eq!(fields.state, 'R');
        assert_eq!(fields.ppid, 77);
        assert_eq!(fields.cpu_ticks, 420);
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert!(parse_stat("garbage").is_none());
        assert!(parse_stat("12 (x)").is_none());
    }

    #[test]
    fn test_parse_tcp_keeps_only_listen_rows() {
        let contents = format!(
            "{TCP_HEADER}   0: 00000000:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 5551 1 0 100 0 0 10 0\n   1: 0100007F:1F90 0100007F:D1A2 01 00000000:00000000 00:00000000 00000000  1000        0 5552 1 0 100 0 0 10 0\n   2: 00000000000000000000000000000000:2328 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 5553 1 0 100 0 0 10 0\n   3: short line\n"
        );
        let listeners = parse_tcp_listeners(&contents);
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[&5551], 3000);
        assert_eq!(listeners[&5553], 9000);
    }

    #[test]
    fn test_socket_inode() {
        assert_eq!(socket_inode("socket:[12345]"), Some(12345));
        assert_eq!(socket_inode("pipe:[12345]"), None);
        assert_eq!(socket_inode("/dev/null"), None);
    }

    #[test]
    fn test_nul_separated_helpers() {
        assert_eq!(join_nul_separated(b"sleep\x00300\x00"), "sleep 300");
        assert_eq!(join_nul_separated(b""), "");
        let env = parse_environ(b"A=1\x00B=x=y\x00junk\x00");
        assert_eq!(env.len(), 2);
        assert_eq!(env["B"], "x=y");
    }

    #[test]
    fn test_port_map_resolves_socket_owners() {
        let proc = FakeProc::new();
        proc.add(100, "nc", 1, &["nc", "-l", "9000"]);
        proc.add(200, "node", 1, &["node", "server.js"]);
        proc.add(300, "bash", 1, &["bash"]);
        proc.set_tcp("tcp", &[("00000000:2328", "0A", 7001), ("00000000:0BB8", "0A", 7002)]);
        proc.set_tcp("tcp6", &[("00000000000000000000000000000000:0BB8", "0A", 7003)]);
        proc.add_socket(100, 3, 7001);
        proc.add_socket(200, 3, 7002);
        proc.add_socket(200, 4, 7003);
        proc.add_socket(300, 5, 9999);

        let map = proc.scanner().build_port_map().unwrap();
        assert_eq!(map[&9000], vec![100]);
        assert_eq!(map[&3000], vec![200]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_port_map_is_cached_copy() {
        let proc = FakeProc::new();
        proc.add(100, "nc", 1, &["nc"]);
        proc.set_tcp("tcp", &[("00000000:2328", "0A", 7001)]);
        proc.add_socket(100, 3, 7001);

        let scanner = proc.scanner().with_ttls(Duration::from_secs(60), Duration::from_secs(60));
        let mut first = scanner.build_port_map().unwrap();
        first.clear();

        // 缓存期内 fd 的变化不可见，且调用方的修改不影响缓存
        proc.add_socket(100, 4, 7001);
        fs::remove_file(proc.root().join("100/fd/3")).unwrap();
        fs::remove_file(proc.root().join("100/fd/4")).unwrap();
        assert_eq!(scanner.build_port_map().unwrap()[&9000], vec![100]);
    }

    #[test]
    fn test_port_map_expires() {
        let proc = FakeProc::new();
        proc.add(100, "nc", 1, &["nc"]);
        proc.set_tcp("tcp", &[("00000000:2328", "0A", 7001)]);
        proc.add_socket(100, 3, 7001);

        let scanner = proc.scanner().with_ttls(Duration::ZERO, Duration::ZERO);
        assert_eq!(scanner.build_port_map().unwrap().len(), 1);
        fs::remove_file(proc.root().join("100/fd/3")).unwrap();
        assert!(scanner.build_port_map().unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let scanner = ProcfsScanner::with_root("/definitely/not/a/proc/root");
        assert!(matches!(
            scanner.build_port_map(),
            Err(OrchestratorError::ProcfsUnreadable { .. })
        ));
        assert!(scanner.list_processes().is_err());
    }

    #[test]
    fn test_read_process_info_full() {
        let proc = FakeProc::new();
        proc.add(100, "python3", 1, &["python3", "app.py", "--port", "9000"]);
        proc.add_exe(100, "/usr/bin/python3.12", "/srv/app");
        proc.set_tcp("tcp", &[("00000000:2328", "0A", 7001)]);
        proc.add_socket(100, 3, 7001);

        let info = proc.scanner().read_process_info(100).unwrap();
        assert_eq!(info.pid, 100);
        assert_eq!(info.ppid, 1);
        assert_eq!(info.name, "python3");
        assert_eq!(info.cmdline, "python3 app.py --port 9000");
        assert_eq!(info.exe, "/usr/bin/python3.12");
        assert_eq!(info.cwd, "/srv/app");
        assert_eq!(info.environ["PATH"], "/bin:/usr/bin");
        assert_eq!(info.environ["EMPTY"], "");
        assert_eq!(info.ports, vec![9000]);
        assert!(!info.kernel_thread);
        assert!(info.cpu_time > 0.0);
    }

    #[test]
    fn test_kernel_thread_skips_expensive_reads() {
        let proc = FakeProc::new();
        proc.add(2, "kthreadd", 0, &[]);
        proc.add(55, "kworker/0:1", 2, &[]);
        proc.add_exe(55, "/should/not/be/read", "/");

        let scanner = proc.scanner();
        let info = scanner.read_process_info(55).unwrap();
        assert!(info.kernel_thread);
        assert!(info.exe.is_empty());
        assert!(info.environ.is_empty());
        assert!(scanner.read_process_info(2).unwrap().kernel_thread);
    }

    #[test]
    fn test_vanished_pid_is_evicted() {
        let proc = FakeProc::new();
        let pdir = proc.add(100, "sleep", 1, &["sleep", "5"]);
        let scanner = proc.scanner().with_ttls(Duration::ZERO, Duration::from_secs(60));

        assert!(scanner.read_process_info(100).is_ok());
        fs::remove_dir_all(pdir).unwrap();
        // 仍在缓存期内
        assert!(scanner.read_process_info(100).is_ok());

        let scanner = proc.scanner().with_ttls(Duration::ZERO, Duration::ZERO);
        assert!(matches!(
            scanner.read_process_info(100),
            Err(OrchestratorError::ProcessNotFound(100))
        ));
        assert!(scanner.read_process_info(-5).is_err());
    }

    #[test]
    fn test_parent_chain_stops_at_init() {
        let proc = FakeProc::new();
        proc.add(1, "systemd", 0, &["/sbin/init"]);
        proc.add(10, "bash", 1, &["bash"]);
        proc.add(20, "bun", 10, &["bun", "dev"]);
        proc.add(30, "node", 20, &["node", "server.js"]);

        let chain = proc.scanner().get_parent_chain(30);
        let pids: Vec<i32> = chain.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![30, 20, 10, 1]);

        let launch = find_launch_script(&chain).unwrap();
        assert_eq!(launch.pid, 20);
    }

    #[test]
    fn test_parent_chain_guards() {
        let proc = FakeProc::new();
        // 环：40 -> 41 -> 40
        proc.add(40, "a", 41, &["a"]);
        proc.add(41, "b", 40, &["b"]);
        // 祖先不可读：50 -> 999（不存在）
        proc.add(50, "orphan", 999, &["orphan"]);

        let scanner = proc.scanner();
        let cycle: Vec<i32> = scanner.get_parent_chain(40).iter().map(|p| p.pid).collect();
        assert_eq!(cycle, vec![40, 41]);

        let truncated = scanner.get_parent_chain(50);
        assert_eq!(truncated.len(), 1);
        assert!(scanner.get_parent_chain(777).is_empty());
    }

    #[test]
    fn test_parent_chain_hop_limit() {
        let proc = FakeProc::new();
        for pid in 1000..1150 {
            proc.add(pid, "link", pid + 1, &["link"]);
        }
        assert_eq!(proc.scanner().get_parent_chain(1000).len(), MAX_CHAIN_HOPS);
    }

    #[test]
    fn test_launch_script_fallback_and_exe_shell() {
        let chain = vec![
            ProcessInfo { pid: 30, ppid: 20, name: "worker".into(), ..Default::default() },
            ProcessInfo { pid: 20, ppid: 1, name: "supervisor".into(), ..Default::default() },
            ProcessInfo { pid: 1, ppid: 0, name: "systemd".into(), ..Default::default() },
        ];
        assert_eq!(find_launch_script(&chain).unwrap().pid, 20);

        let chain = vec![
            ProcessInfo { pid: 30, ppid: 20, name: "app".into(), ..Default::default() },
            ProcessInfo {
                pid: 20,
                ppid: 1,
                name: "renamed".into(),
                exe: "/usr/bin/zsh".into(),
                ..Default::default()
            },
        ];
        assert_eq!(find_launch_script(&chain).unwrap().pid, 30);
        assert!(find_launch_script(&[]).is_none());
    }

    #[test]
    fn test_discovery_queries() {
        let proc = FakeProc::new();
        proc.add(1, "init", 0, &["/sbin/init"]);
        proc.add(2, "kthreadd", 0, &[]);
        proc.add(100, "nc", 1, &["nc", "-l", "9000"]);
        proc.add(200, "sleep", 1, &["sleep", "60"]);
        proc.set_tcp("tcp", &[("00000000:2328", "0A", 7001)]);
        proc.add_socket(100, 3, 7001);

        let scanner = proc.scanner();
        assert_eq!(scanner.get_processes_listening_on_port(9000).unwrap(), vec![100]);
        assert!(scanner.get_processes_listening_on_port(81).unwrap().is_empty());
        assert_eq!(scanner.get_ports_for_process(100).unwrap(), vec![9000]);

        let found = scanner.discover_process_on_port(9000).unwrap();
        assert_eq!(found.info.pid, 100);
        assert_eq!(found.parent_chain.len(), 2);
        assert!(matches!(
            scanner.discover_process_on_port(81),
            Err(OrchestratorError::NoListenerOnPort(81))
        ));

        let all: Vec<i32> = {
            let mut pids: Vec<i32> = scanner
                .discover_processes(&[200], false)
                .unwrap()
                .iter()
                .map(|p| p.pid)
                .collect();
            pids.sort_unstable();
            pids
        };
        assert_eq!(all, vec![1, 100]);

        let listening = scanner.discover_processes(&[], true).unwrap();
        assert_eq!(listening.len(), 1);
        assert_eq!(listening[0].pid, 100);
    }

    #[test]
    fn test_is_running_on_live_process_table() {
        let scanner = ProcfsScanner::new();
        assert!(scanner.is_running(std::process::id() as i32));
        assert!(!scanner.is_running(0));
        assert!(!scanner.is_running(i32::MAX - 1));
    }
}
