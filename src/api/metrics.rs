use actix_web::{web, HttpResponse, Responder};

use crate::context::AppContext;

pub async fn get_metrics(ctx: web::Data<AppContext>) -> impl Responder {
    let ctx = ctx.into_inner();
    let metrics = ctx.metrics.clone();

    // 刷新实例状态后再取快照
    let snapshot = web::block(move || {
        ctx.refresh();
        ctx.state.snapshot()
    })
    .await;

    let snapshot = match snapshot {
        Ok(snapshot) => snapshot,
        Err(e) => {
            log::error!("Failed to refresh instances: {}", e);
            return HttpResponse::InternalServerError().body("Failed to refresh instances");
        }
    };
    metrics.update(&snapshot);

    // 渲染 Prometheus metrics
    match metrics.render() {
        Ok(metrics_text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(metrics_text),
        Err(e) => {
            log::error!("Failed to render metrics: {}", e);
            HttpResponse::InternalServerError().body("Failed to render metrics")
        }
    }
}
