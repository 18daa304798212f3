use serde::Serialize;
use std::collections::HashMap;

/// 从 /proc 读取的进程快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: i32,
    /// 父进程 PID
    pub ppid: i32,
    /// 进程名（/proc/<pid>/stat 中括号内的 comm）
    pub name: String,
    /// 完整命令行，参数以空格连接
    pub cmdline: String,
    /// 可执行文件路径
    pub exe: String,
    /// 工作目录
    pub cwd: String,
    /// 环境变量
    pub environ: HashMap<String, String>,
    /// 正在监听的 TCP 端口
    pub ports: Vec<u16>,
    /// 累计 CPU 时间（秒）
    pub cpu_time: f64,
    #[serde(skip)]
    pub kernel_thread: bool,
    /// stat 状态为 Z：已退出但未被回收
    #[serde(skip)]
    pub zombie: bool,
}

/// 常见内核线程名前缀
const KERNEL_THREAD_PREFIXES: &[&str] = &[
    "kworker", "ksoftirqd", "kthreadd", "kswapd", "migration", "watchdog", "cpuhp",
    "kdevtmpfs", "netns", "kauditd", "khungtaskd", "oom_reaper", "writeback", "kcompactd",
    "crypto", "kblockd", "kintegrityd", "kqueuewq", "ata_sff", "scsi", "pool", "rcu",
    "mm_percpu", "slub",
];

/// 判断是否为内核线程：PID 2，或命令行为空且父进程为 0/2
pub fn is_kernel_thread(pid: i32, ppid: i32, cmdline: &str) -> bool {
    pid == 2 || (cmdline.trim().is_empty() && (ppid == 0 || ppid == 2))
}

impl ProcessInfo {
    /// 发现进程时使用的更宽松判定，额外识别常见的内核线程名
    pub fn looks_like_kernel_thread(&self) -> bool {
        if self.kernel_thread || is_kernel_thread(self.pid, self.ppid, &self.cmdline) {
            return true;
        }
        self.cmdline.trim().is_empty()
            && KERNEL_THREAD_PREFIXES
                .iter()
                .any(|prefix| self.name.starts_with(prefix))
    }

    /// 可执行文件的文件名部分
    pub fn exe_basename(&self) -> &str {
        let exe = self.exe.trim_end_matches(" (deleted)");
        exe.rsplit('/').next().unwrap_or(exe)
    }
}
