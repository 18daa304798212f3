use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 已分配的资源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// tcpport | vncport | gpu | license ...
    #[serde(rename = "type")]
    pub rtype: String,
    pub value: String,
    /// 所属实例名
    pub owner: String,
}

impl Resource {
    pub fn key(rtype: &str, value: &str) -> String {
        format!("{rtype}:{value}")
    }
}

/// 资源类型定义
///
/// `check` 是包含 `${value}` 的 shell 命令：退出码 0 表示已占用，
/// 非 0 表示可用，空字符串表示总是可用。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceType {
    pub name: String,
    #[serde(default)]
    pub check: String,
    /// 是否为自增计数器
    #[serde(default)]
    pub counter: bool,
    #[serde(default)]
    pub start: u32,
    #[serde(default)]
    pub end: u32,
}

impl ResourceType {
    pub fn counter(name: &str, check: &str, start: u32, end: u32) -> Self {
        Self {
            name: name.to_string(),
            check: check.to_string(),
            counter: true,
            start,
            end,
        }
    }

    pub fn explicit(name: &str, check: &str) -> Self {
        Self {
            name: name.to_string(),
            check: check.to_string(),
            ..Default::default()
        }
    }

    /// 内置资源类型
    pub fn defaults() -> HashMap<String, ResourceType> {
        let port_check = "nc -z localhost ${value}";
        [
            ResourceType::counter("tcpport", port_check, 3000, 9999),
            ResourceType::counter("vncport", port_check, 5900, 5999),
            ResourceType::counter("serialport", port_check, 9600, 9699),
            ResourceType::explicit("dbfile", "test -f ${value}"),
            ResourceType::explicit("socket", "test -S ${value}"),
            ResourceType::explicit("datadir", ""),
            ResourceType::explicit("workdir", ""),
        ]
        .into_iter()
        .map(|rt| (rt.name.clone(), rt))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types() {
        let types = ResourceType::defaults();
        assert_eq!(types.len(), 7);
        let tcp = &types["tcpport"];
        assert!(tcp.counter);
        assert_eq!((tcp.start, tcp.end), (3000, 9999));
        assert!(types["workdir"].check.is_empty());
        assert!(!types["dbfile"].counter);
    }

    #[test]
    fn test_resource_serializes_type_field() {
        let res = Resource {
            rtype: "tcpport".into(),
            value: "3000".into(),
            owner: "web".into(),
        };
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["type"], "tcpport");
        assert_eq!(Resource::key("tcpport", "3000"), "tcpport:3000");
    }
}
