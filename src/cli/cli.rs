use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Process Orchestrator - 本地进程编排
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    /// 状态文件路径，默认 ~/.vibeprocess/state.json
    #[arg(long, env = "ORCH_STATE_FILE", global = true)]
    pub state_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 列出全部实例
    Ps,
    /// 从模板启动实例，变量写成 --key=value
    Start {
        template: String,
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        vars: Vec<String>,
    },
    /// 停止实例并释放资源
    Stop { name: String },
    /// 以原有命令和资源重启已停止的实例
    Restart { name: String },
    /// 删除实例（运行中则先停止）
    Delete { name: String },
    /// 查看实例详情
    Inspect { name: String },
    /// 监控一个已在运行的进程
    Monitor { pid: i32, name: String },
    /// 列出尚未跟踪的进程
    Discover {
        /// 包括没有监听端口的进程
        #[arg(long)]
        all: bool,
    },
    /// 按 PID 导入进程
    Import { pid: i32, name: String },
    /// 导入监听指定端口的进程
    ImportPort { port: u16, name: String },
    /// 执行实例的 action
    Action { name: String },
    /// 模板管理
    Template {
        #[command(subcommand)]
        action: TemplateCommand,
    },
    /// 资源类型管理
    ResourceType {
        #[command(subcommand)]
        action: ResourceTypeCommand,
    },
    /// 启动 HTTP API
    Serve(ServeArgs),
}

#[derive(Subcommand, Debug)]
pub enum TemplateCommand {
    List,
    Show { id: String },
    /// 从 JSON 文件添加模板
    Add { file: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum ResourceTypeCommand {
    List,
    Add {
        name: String,
        /// 可用性检查命令，`${value}` 会被替换
        #[arg(long, default_value = "")]
        check: String,
        #[arg(long)]
        counter: bool,
        #[arg(long, default_value_t = 0)]
        start: u32,
        #[arg(long, default_value_t = 0)]
        end: u32,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// 监听端口
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// 监听地址
    #[arg(short = 'a', long, env = "ADDRESS", default_value = "127.0.0.1")]
    pub address: String,

    /// 后台对账间隔（秒）
    #[arg(long, env = "ORCH_REFRESH_SECS", default_value_t = 5)]
    pub refresh_secs: u64,
}
