use prometheus::{
    register_gauge_vec_with_registry, Encoder, GaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use sysinfo::System;

use crate::state::AppStateInner;

pub struct MetricsRegistry {
    registry: Registry,
    hostname: String,

    pub instance_up: GaugeVec,
    pub instance_pid_info: GaugeVec,
    pub instance_cpu_seconds: GaugeVec,
    pub instance_started_timestamp: GaugeVec,
    pub resource_claims: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        // 定义通用的标签
        let common_labels = &["name", "template", "hostname"];

        let instance_up = register_gauge_vec_with_registry!(
            Opts::new("instance_up", "Instance is running (1) or not (0)"),
            common_labels,
            registry
        )?;

        let instance_pid_info = register_gauge_vec_with_registry!(
            Opts::new("instance_pid_info", "Instance PID information"),
            &["name", "pid", "hostname"],
            registry
        )?;

        let instance_cpu_seconds = register_gauge_vec_with_registry!(
            Opts::new("instance_cpu_seconds", "Accumulated CPU time of the instance process"),
            common_labels,
            registry
        )?;

        let instance_started_timestamp = register_gauge_vec_with_registry!(
            Opts::new(
                "instance_started_timestamp_seconds",
                "Unix timestamp when the instance was last started or matched"
            ),
            common_labels,
            registry
        )?;

        let resource_claims = register_gauge_vec_with_registry!(
            Opts::new("resource_claims", "Number of claimed resources per type"),
            &["type", "hostname"],
            registry
        )?;

        Ok(Self {
            registry,
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            instance_up,
            instance_pid_info,
            instance_cpu_seconds,
            instance_started_timestamp,
            resource_claims,
        })
    }

    /// 用当前状态快照重建全部指标；已删除的实例不再出现
    pub fn update(&self, state: &AppStateInner) {
        self.instance_up.reset();
        self.instance_pid_info.reset();
        self.instance_cpu_seconds.reset();
        self.instance_started_timestamp.reset();
        self.resource_claims.reset();

        let host = self.hostname.as_str();
        for inst in state.instances.values() {
            let labels = &[inst.name.as_str(), inst.template.as_str(), host];

            self.instance_up
                .with_label_values(labels)
                .set(if inst.is_running() { 1.0 } else { 0.0 });

            // 只有进程运行时才输出 PID 与 CPU
            if inst.is_running() {
                self.instance_pid_info
                    .with_label_values(&[inst.name.as_str(), &inst.pid.to_string(), host])
                    .set(1.0);
                self.instance_cpu_seconds
                    .with_label_values(labels)
                    .set(inst.cpu_time);
            }

            if inst.started > 0 {
                self.instance_started_timestamp
                    .with_label_values(labels)
                    .set(inst.started as f64);
            }
        }

        let mut claims: HashMap<&str, usize> = HashMap::new();
        for res in state.resources.values() {
            *claims.entry(res.rtype.as_str()).or_default() += 1;
        }
        for (rtype, count) in claims {
            self.resource_claims
                .with_label_values(&[rtype, host])
                .set(count as f64);
        }
    }

    pub fn render(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
