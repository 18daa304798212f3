use actix_web::{web, App, HttpServer};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

mod api;
mod cli;
mod context;
mod error;
mod metrics;
mod models;
mod services;
mod state;

use cli::{commands, CommandArgs, Commands, ServeArgs};
use context::AppContext;
use services::JsonFileStore;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CommandArgs::parse();
    let path = args
        .state_file
        .clone()
        .unwrap_or_else(JsonFileStore::default_path);
    log::debug!("Using state file {}", path.display());

    let ctx = AppContext::load(Arc::new(JsonFileStore::new(path)))?;

    match args.command {
        Some(Commands::Serve(serve_args)) => serve(ctx, serve_args).await,
        Some(command) => commands::run(&ctx, command),
        None => commands::run(&ctx, Commands::Ps),
    }
}

async fn serve(ctx: AppContext, args: ServeArgs) -> anyhow::Result<()> {
    let bind_address = format!("{}:{}", args.address, args.port);

    log::info!("🔄 Running discovery to match existing processes...");
    if let Some(report) = ctx.refresh() {
        log::info!("✅ Matched {} instance(s)", report.matched.len());
    }

    spawn_refresher(ctx.clone(), Duration::from_secs(args.refresh_secs.max(1)));
    print_banner(&args);

    let data = web::Data::new(ctx);
    HttpServer::new(move || App::new().app_data(data.clone()).configure(api::configure))
        .bind(&bind_address)?
        .run()
        .await?;
    Ok(())
}

/// 周期性对账，保持实例状态与进程表一致
fn spawn_refresher(ctx: AppContext, period: Duration) {
    actix_rt::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // 第一次 tick 立即返回，启动时已经对账过
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let ctx = ctx.clone();
            match tokio::task::spawn_blocking(move || ctx.refresh()).await {
                Ok(Some(report)) if report.transitions() > 0 => log::info!(
                    "Refresh: {} stopped, {} matched",
                    report.stopped.len(),
                    report.matched.len()
                ),
                Ok(_) => {}
                Err(e) => log::warn!("Refresh task failed: {}", e),
            }
        }
    });
}

fn print_banner(args: &ServeArgs) {
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║      Process Orchestrator v{:<31}║", env!("CARGO_PKG_VERSION"));
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("🚀 Server starting on http://{}:{}", args.address, args.port);
    println!();
    println!("📋 Available endpoints:");
    println!("  GET    /api/instances          - List instances (runs matching)");
    println!("  POST   /api/instances          - start | stop | restart | delete");
    println!("  GET    /api/instances/{{name}}   - Inspect an instance");
    println!("  GET    /api/templates          - List templates");
    println!("  POST   /api/templates          - Add a template");
    println!("  GET    /api/resources          - Claimed resources by type");
    println!("  GET    /api/resource-types     - List resource types");
    println!("  POST   /api/resource-types     - Add a resource type");
    println!("  GET    /api/discover           - Untracked processes");
    println!("  POST   /api/discover-port      - Import the process on a port");
    println!("  POST   /api/monitor            - Monitor a running PID");
    println!("  POST   /api/execute-action     - Run an instance action");
    println!("  GET    /metrics                - Prometheus metrics");
    println!("  GET    /health                 - Health check");
    println!();
    println!("💡 Refresh interval: {}s", args.refresh_secs.max(1));
    println!("═══════════════════════════════════════════════════════════");
}
