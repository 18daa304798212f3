use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::collections::HashMap;

use crate::context::AppContext;
use crate::error::OrchestratorError;
use crate::models::Instance;

#[derive(Deserialize)]
pub struct InstanceActionRequest {
    /// start | stop | restart | delete
    pub action: String,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub instance_id: String,
}

#[derive(Deserialize)]
pub struct MonitorRequest {
    pub pid: i32,
    pub name: String,
}

#[derive(Deserialize)]
pub struct DiscoverPortRequest {
    pub port: u16,
    pub name: String,
}

#[derive(Deserialize)]
pub struct DiscoverQuery {
    pub ports_only: Option<bool>,
}

#[derive(Deserialize)]
pub struct ExecuteActionRequest {
    pub instance_name: String,
}

enum ActionOutcome {
    Instance(Instance),
    Deleted,
}

/// 先对账再返回全部实例
pub async fn list_instances(ctx: web::Data<AppContext>) -> actix_web::Result<HttpResponse> {
    let ctx = ctx.into_inner();
    let instances = web::block(move || {
        ctx.refresh();
        ctx.state.lock().instances.clone()
    })
    .await?;
    Ok(HttpResponse::Ok().json(instances))
}

pub async fn get_instance(
    ctx: web::Data<AppContext>,
    path: web::Path<String>,
) -> actix_web::Result<HttpResponse> {
    let ctx = ctx.into_inner();
    let name = path.into_inner();
    let inst = web::block(move || {
        ctx.refresh();
        ctx.state
            .lock()
            .instances
            .get(&name)
            .cloned()
            .ok_or(OrchestratorError::InstanceNotFound(name))
    })
    .await??;
    Ok(HttpResponse::Ok().json(inst))
}

pub async fn instance_action(
    ctx: web::Data<AppContext>,
    req: web::Json<InstanceActionRequest>,
) -> actix_web::Result<HttpResponse> {
    let req = req.into_inner();
    if !matches!(req.action.as_str(), "start" | "stop" | "restart" | "delete") {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": format!("invalid action: {}", req.action)
        })));
    }

    let ctx = ctx.into_inner();
    let outcome = web::block(move || {
        let controller = &ctx.controller;
        match req.action.as_str() {
            "start" => controller
                .start_from_template(&req.template, &req.name, &req.vars)
                .map(ActionOutcome::Instance),
            "stop" => controller
                .stop_and_release(&req.instance_id)
                .map(ActionOutcome::Instance),
            "restart" => controller
                .restart_process(&req.instance_id)
                .map(ActionOutcome::Instance),
            _ => controller
                .delete_instance(&req.instance_id)
                .map(|()| ActionOutcome::Deleted),
        }
    })
    .await??;

    Ok(match outcome {
        ActionOutcome::Instance(inst) => HttpResponse::Ok().json(inst),
        ActionOutcome::Deleted => HttpResponse::Ok().json(serde_json::json!({
            "status": "deleted"
        })),
    })
}

pub async fn monitor(
    ctx: web::Data<AppContext>,
    req: web::Json<MonitorRequest>,
) -> actix_web::Result<HttpResponse> {
    let ctx = ctx.into_inner();
    let MonitorRequest { pid, name } = req.into_inner();
    let inst = web::block(move || ctx.controller.monitor_process(pid, &name)).await??;
    Ok(HttpResponse::Ok().json(inst))
}

/// 默认只列出有监听端口的进程，`?ports_only=false` 列出全部
pub async fn discover(
    ctx: web::Data<AppContext>,
    query: web::Query<DiscoverQuery>,
) -> actix_web::Result<HttpResponse> {
    let ctx = ctx.into_inner();
    let ports_only = query.ports_only.unwrap_or(true);
    let processes = web::block(move || ctx.discover(ports_only)).await??;
    Ok(HttpResponse::Ok().json(processes))
}

pub async fn discover_port(
    ctx: web::Data<AppContext>,
    req: web::Json<DiscoverPortRequest>,
) -> actix_web::Result<HttpResponse> {
    let ctx = ctx.into_inner();
    let DiscoverPortRequest { port, name } = req.into_inner();
    let inst = web::block(move || ctx.controller.import_process_on_port(port, &name)).await??;
    Ok(HttpResponse::Ok().json(inst))
}

pub async fn execute_action(
    ctx: web::Data<AppContext>,
    req: web::Json<ExecuteActionRequest>,
) -> actix_web::Result<HttpResponse> {
    let ctx = ctx.into_inner();
    let name = req.into_inner().instance_name;
    let action = web::block(move || ctx.controller.execute_action(&name)).await??;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "executed",
        "action": action
    })))
}
