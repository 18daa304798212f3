use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// 实例运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// 受管或被监控的进程实例
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Instance {
    /// 实例名称（唯一标识符）
    pub name: String,
    /// 模板 ID
    #[serde(default)]
    pub template: String,
    /// 插值后的最终命令
    #[serde(default)]
    pub command: String,
    /// 进程 ID，未运行时为 0
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub status: InstanceStatus,
    /// 资源类型 -> 值
    #[serde(default)]
    pub resources: HashMap<String, String>,
    /// 启动时间戳（Unix 时间）
    #[serde(default)]
    pub started: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    /// true = 可停止/重启，false = 仅监控
    #[serde(default)]
    pub managed: bool,
    #[serde(default, rename = "cputime", skip_serializing_if = "is_zero")]
    pub cpu_time: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Instance {
    pub fn new(name: &str, template: &str) -> Self {
        Self {
            name: name.to_string(),
            template: template.to_string(),
            status: InstanceStatus::Starting,
            ..Default::default()
        }
    }

    pub fn mark_running(&mut self, pid: i32) {
        self.pid = pid;
        self.status = InstanceStatus::Running;
        self.started = now_secs();
    }

    pub fn mark_stopped(&mut self) {
        self.pid = 0;
        self.status = InstanceStatus::Stopped;
    }

    pub fn mark_error(&mut self, message: String) {
        self.pid = 0;
        self.status = InstanceStatus::Error;
        self.error = message;
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// 命令首个 token 去掉路径后的文件名
    pub fn expected_basename(&self) -> &str {
        extract_process_name(&self.command)
    }

    /// `tcpport` / `port` 资源声明的端口
    pub fn expected_ports(&self) -> Vec<u16> {
        self.resources
            .iter()
            .filter(|(rtype, _)| rtype.as_str() == "tcpport" || rtype.as_str() == "port")
            .filter_map(|(_, value)| value.parse::<u16>().ok())
            .filter(|port| *port > 0)
            .collect()
    }
}

pub fn extract_process_name(command: &str) -> &str {
    let Some(exe) = command.split_whitespace().next() else {
        return "";
    };
    exe.rsplit('/').next().unwrap_or(exe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_process_name() {
        assert_eq!(extract_process_name("/usr/bin/nc -l 9000"), "nc");
        assert_eq!(extract_process_name("  sleep 300"), "sleep");
        assert_eq!(extract_process_name(""), "");
        assert_eq!(extract_process_name("   "), "");
    }

    #[test]
    fn test_pid_status_invariant_helpers() {
        let mut inst = Instance::new("web", "node-express");
        assert_eq!(inst.status, InstanceStatus::Starting);

        inst.mark_running(4242);
        assert!(inst.is_running());
        assert_eq!(inst.pid, 4242);
        assert!(inst.started > 0);

        inst.mark_stopped();
        assert_eq!(inst.pid, 0);
        assert_eq!(inst.status, InstanceStatus::Stopped);

        inst.mark_error("boom".into());
        assert_eq!(inst.pid, 0);
        assert_eq!(inst.status, InstanceStatus::Error);
        assert_eq!(inst.error, "boom");
    }

    #[test]
    fn test_expected_ports_ignores_other_resources() {
        let mut inst = Instance::new("db", "postgres");
        inst.resources.insert("tcpport".into(), "5432".into());
        inst.resources.insert("datadir".into(), "/tmp/pg".into());
        inst.resources.insert("port".into(), "not-a-number".into());
        assert_eq!(inst.expected_ports(), vec![5432]);
    }

    #[test]
    fn test_serialized_field_names() {
        let mut inst = Instance::new("a", "t");
        inst.mark_running(10);
        inst.cpu_time = 1.5;
        let json = serde_json::to_value(&inst).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["cputime"], 1.5);
        assert!(json.get("error").is_none());

        let back: Instance = serde_json::from_value(json).unwrap();
        assert_eq!(back.pid, 10);
    }
}
