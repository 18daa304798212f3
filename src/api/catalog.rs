use actix_web::{web, HttpResponse, Responder};

use crate::context::AppContext;
use crate::models::{ResourceType, Template};

pub async fn list_templates(ctx: web::Data<AppContext>) -> impl Responder {
    let templates = ctx.state.lock().templates.clone();
    HttpResponse::Ok().json(templates)
}

pub async fn add_template(
    ctx: web::Data<AppContext>,
    req: web::Json<Template>,
) -> actix_web::Result<HttpResponse> {
    let template = req.into_inner();
    if template.id.is_empty() {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": "id is required"
        })));
    }
    let ctx = ctx.into_inner();
    let saved = template.clone();
    web::block(move || ctx.add_template(template)).await?;
    Ok(HttpResponse::Ok().json(saved))
}

/// 按类型分组的资源占用
pub async fn list_resources(ctx: web::Data<AppContext>) -> impl Responder {
    let grouped = ctx.state.lock().resources_by_type();
    HttpResponse::Ok().json(grouped)
}

pub async fn list_resource_types(ctx: web::Data<AppContext>) -> impl Responder {
    let types = ctx.state.lock().types.clone();
    HttpResponse::Ok().json(types)
}

pub async fn add_resource_type(
    ctx: web::Data<AppContext>,
    req: web::Json<ResourceType>,
) -> actix_web::Result<HttpResponse> {
    let rt = req.into_inner();
    if rt.name.trim().is_empty() {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": "name is required"
        })));
    }
    let ctx = ctx.into_inner();
    let saved = web::block(move || ctx.add_resource_type(rt)).await?;
    Ok(HttpResponse::Ok().json(saved))
}
