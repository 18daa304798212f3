pub mod catalog;
pub mod instances;
pub mod metrics;

pub use catalog::{
    add_resource_type, add_template, list_resource_types, list_resources, list_templates,
};
pub use instances::{
    discover, discover_port, execute_action, get_instance, instance_action, list_instances,
    monitor,
};
pub use metrics::get_metrics;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder, ResponseError};

use crate::error::OrchestratorError;

impl ResponseError for OrchestratorError {
    fn status_code(&self) -> StatusCode {
        if self.is_not_found() {
            return StatusCode::NOT_FOUND;
        }
        match self {
            OrchestratorError::InstanceAlreadyExists(_) => StatusCode::CONFLICT,
            OrchestratorError::ProcfsUnreadable { .. } | OrchestratorError::ActionFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "status": "error",
            "message": self.to_string()
        }))
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/instances", web::get().to(list_instances))
        .route("/api/instances", web::post().to(instance_action))
        .route("/api/instances/{name}", web::get().to(get_instance))
        .route("/api/templates", web::get().to(list_templates))
        .route("/api/templates", web::post().to(add_template))
        .route("/api/resources", web::get().to(list_resources))
        .route("/api/resource-types", web::get().to(list_resource_types))
        .route("/api/resource-types", web::post().to(add_resource_type))
        .route("/api/discover", web::get().to(discover))
        .route("/api/discover-port", web::post().to(discover_port))
        .route("/api/monitor", web::post().to(monitor))
        .route("/api/execute-action", web::post().to(execute_action))
        .route("/metrics", web::get().to(get_metrics))
        .route("/health", web::get().to(health));
}

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy"
    }))
}
