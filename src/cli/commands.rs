use anyhow::{bail, Context};
use std::collections::HashMap;
use std::fs;

use crate::cli::cli::{Commands, ResourceTypeCommand, TemplateCommand};
use crate::context::AppContext;
use crate::models::{Instance, ResourceType, Template};

/// 执行一条前台命令（serve 除外）
pub fn run(ctx: &AppContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Ps => list_instances(ctx),
        Commands::Start {
            template,
            name,
            vars,
        } => {
            ctx.refresh();
            let vars = parse_vars(&vars);
            let inst = ctx.controller.start_from_template(&template, &name, &vars)?;
            println!("Started {} (PID {})", inst.name, inst.pid);
            print_command_and_resources(&inst);
            Ok(())
        }
        Commands::Stop { name } => {
            ctx.refresh();
            ctx.controller.stop_and_release(&name)?;
            println!("Stopped {}", name);
            Ok(())
        }
        Commands::Restart { name } => {
            ctx.refresh();
            let inst = ctx.controller.restart_process(&name)?;
            println!("Restarted {} (PID {})", inst.name, inst.pid);
            print_command_and_resources(&inst);
            Ok(())
        }
        Commands::Delete { name } => {
            ctx.refresh();
            ctx.controller.delete_instance(&name)?;
            println!("Deleted {}", name);
            Ok(())
        }
        Commands::Inspect { name } => inspect(ctx, &name),
        Commands::Monitor { pid, name } => {
            let inst = ctx.controller.monitor_process(pid, &name)?;
            println!("Monitoring {} (PID {}, managed: {})", inst.name, inst.pid, inst.managed);
            print_command_and_resources(&inst);
            Ok(())
        }
        Commands::Discover { all } => {
            let processes = ctx.discover(!all)?;
            if processes.is_empty() {
                println!("No untracked processes found");
                return Ok(());
            }
            println!("{:<8} {:<8} {:<20} {:<16} {}", "PID", "PPID", "NAME", "PORTS", "COMMAND");
            for p in processes {
                let ports: Vec<String> = p.ports.iter().map(u16::to_string).collect();
                println!(
                    "{:<8} {:<8} {:<20} {:<16} {}",
                    p.pid,
                    p.ppid,
                    truncate(&p.name, 20),
                    ports.join(","),
                    truncate(&p.cmdline, 60)
                );
            }
            Ok(())
        }
        Commands::Import { pid, name } => {
            let inst = ctx.controller.import_process(pid, &name)?;
            println!("Imported process: {}", inst.name);
            println!("  PID:     {}", inst.pid);
            println!("  Command: {}", inst.command);
            Ok(())
        }
        Commands::ImportPort { port, name } => {
            let inst = ctx.controller.import_process_on_port(port, &name)?;
            println!("Imported process on port {}: {}", port, inst.name);
            println!("  PID:     {}", inst.pid);
            println!("  Command: {}", inst.command);
            Ok(())
        }
        Commands::Action { name } => {
            let action = ctx.controller.execute_action(&name)?;
            println!("Executed: {}", action);
            Ok(())
        }
        Commands::Template { action } => template_command(ctx, action),
        Commands::ResourceType { action } => resource_type_command(ctx, action),
        Commands::Serve(_) => bail!("serve must be started from main"),
    }
}

fn list_instances(ctx: &AppContext) -> anyhow::Result<()> {
    ctx.refresh();
    let mut instances: Vec<Instance> = ctx.state.lock().instances.values().cloned().collect();
    if instances.is_empty() {
        println!("No instances running");
        return Ok(());
    }
    instances.sort_by(|a, b| a.name.cmp(&b.name));

    println!(
        "{:<20} {:<10} {:<8} {:<12} {:<40} {}",
        "NAME", "STATUS", "PID", "CPU TIME", "COMMAND", "RESOURCES"
    );
    for inst in instances {
        println!(
            "{:<20} {:<10} {:<8} {:<12} {:<40} {}",
            inst.name,
            inst.status,
            inst.pid,
            format_cpu_time(inst.cpu_time),
            truncate(&inst.command, 40),
            format_resources(&inst.resources)
        );
    }
    Ok(())
}

fn inspect(ctx: &AppContext, name: &str) -> anyhow::Result<()> {
    ctx.refresh();
    let inst = ctx
        .state
        .lock()
        .instances
        .get(name)
        .cloned()
        .with_context(|| format!("Instance not found: {}", name))?;

    println!("{}", serde_json::to_string_pretty(&inst)?);
    println!();
    println!("--- Summary ---");
    println!("Name:     {}", inst.name);
    println!("Status:   {}", inst.status);
    println!("PID:      {}", inst.pid);
    println!("Template: {}", inst.template);
    println!("Command:  {}", inst.command);
    println!("Managed:  {}", inst.managed);
    println!("CPU time: {}", format_cpu_time(inst.cpu_time));
    if !inst.error.is_empty() {
        println!("Error:    {}", inst.error);
    }
    if !inst.resources.is_empty() {
        println!();
        println!("--- Resources ---");
        for (k, v) in sorted(&inst.resources) {
            println!("  {} = {}", k, v);
        }
    }
    Ok(())
}

fn template_command(ctx: &AppContext, action: TemplateCommand) -> anyhow::Result<()> {
    match action {
        TemplateCommand::List => {
            let templates = ctx.state.lock().templates.clone();
            let mut ids: Vec<&String> = templates.keys().collect();
            ids.sort();
            for id in ids {
                println!("{:<20} {}", id, templates[id].label);
            }
        }
        TemplateCommand::Show { id } => {
            let template = ctx
                .state
                .lock()
                .templates
                .get(&id)
                .cloned()
                .with_context(|| format!("Template not found: {}", id))?;
            println!("{}", serde_json::to_string_pretty(&template)?);
        }
        TemplateCommand::Add { file } => {
            let data = fs::read_to_string(&file)
                .with_context(|| format!("Error reading {}", file.display()))?;
            let template: Template =
                serde_json::from_str(&data).context("Error parsing template")?;
            if template.id.is_empty() {
                bail!("template id is required");
            }
            let id = template.id.clone();
            ctx.add_template(template);
            println!("Added template: {}", id);
        }
    }
    Ok(())
}

fn resource_type_command(ctx: &AppContext, action: ResourceTypeCommand) -> anyhow::Result<()> {
    match action {
        ResourceTypeCommand::List => {
            let types = ctx.state.lock().types.clone();
            let mut names: Vec<&String> = types.keys().collect();
            names.sort();
            for name in names {
                let rt = &types[name];
                let range = if rt.counter {
                    format!("{}-{}", rt.start, rt.end)
                } else {
                    "-".to_string()
                };
                println!(
                    "{:<15} counter={:<5} range={:<11} check={}",
                    name, rt.counter, range, rt.check
                );
            }
        }
        ResourceTypeCommand::Add {
            name,
            check,
            counter,
            start,
            end,
        } => {
            if counter && end < start {
                bail!("end ({}) must not be below start ({})", end, start);
            }
            let rt = ctx.add_resource_type(ResourceType {
                name,
                check,
                counter,
                start,
                end,
            });
            println!("Added resource type: {}", rt.name);
        }
    }
    Ok(())
}

fn print_command_and_resources(inst: &Instance) {
    println!("Command: {}", inst.command);
    println!("Resources:");
    for (k, v) in sorted(&inst.resources) {
        println!("  {} = {}", k, v);
    }
}

fn sorted(map: &HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut pairs: Vec<_> = map.iter().collect();
    pairs.sort();
    pairs
}

fn format_resources(resources: &HashMap<String, String>) -> String {
    sorted(resources)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// 人类可读的 CPU 时间
pub fn format_cpu_time(seconds: f64) -> String {
    if seconds <= 0.0 {
        return "-".to_string();
    }
    if seconds < 60.0 {
        return format!("{:.2}s", seconds);
    }
    let total = seconds as u64;
    if seconds < 3600.0 {
        format!("{}m {}s", total / 60, total % 60)
    } else {
        format!("{}h {}m", total / 3600, (total / 60) % 60)
    }
}

/// `--key=value` 形式的变量；只有 `--flag` 时值为 "true"
pub fn parse_vars(args: &[String]) -> HashMap<String, String> {
    args.iter()
        .filter_map(|arg| arg.strip_prefix("--"))
        .filter(|arg| !arg.is_empty())
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (arg.to_string(), "true".to_string()),
        })
        .collect()
}

/// 按字符截断，超长时以 "..." 结尾
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
