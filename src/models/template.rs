use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 进程模板：命令中可使用 `${var}` 与 `%counter` 占位符
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub command: String,
    /// 需要分配的资源类型（按顺序）
    #[serde(default)]
    pub resources: Vec<String>,
    /// 默认变量
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl Template {
    pub fn defaults() -> HashMap<String, Template> {
        let templates = [
            Template {
                id: "postgres".into(),
                label: "PostgreSQL Database".into(),
                command: "postgres -D ${datadir} -p ${tcpport}".into(),
                resources: vec!["tcpport".into(), "datadir".into()],
                vars: HashMap::from([("datadir".to_string(), "/tmp/pgdata".to_string())]),
                action: None,
            },
            Template {
                id: "node-express".into(),
                label: "Node.js Express Server".into(),
                command: "node server.js --port ${tcpport}".into(),
                resources: vec!["tcpport".into()],
                vars: HashMap::new(),
                action: None,
            },
            Template {
                id: "qemu".into(),
                label: "QEMU Virtual Machine".into(),
                command:
                    "qemu-system-x86_64 -vnc :${vncport} -serial tcp::${serialport},server,nowait ${args}"
                        .into(),
                resources: vec!["vncport".into(), "serialport".into()],
                vars: HashMap::from([("args".to_string(), "-m 2G".to_string())]),
                action: None,
            },
        ];
        templates.into_iter().map(|t| (t.id.clone(), t)).collect()
    }
}
