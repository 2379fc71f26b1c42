use std::sync::Arc;

use atty::Stream;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};

use quiver_core::{
    CommandStatus, ExecutionOutcome, Orchestrator, SharedEffects, SystemEffects,
};

mod cli;
mod style;

use cli::{Command, QuiverCli};
use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = QuiverCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let effects: SharedEffects = Arc::new(SystemEffects::default());
    let orchestrator = Orchestrator::from_env(effects).map_err(|err| eyre!("{err:?}"))?;
    let outcome = dispatch(&orchestrator, &cli.command).map_err(|err| eyre!("{err:?}"))?;
    let code = emit_output(&cli, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn dispatch(orchestrator: &Orchestrator, command: &Command) -> anyhow::Result<ExecutionOutcome> {
    match command {
        Command::List => orchestrator.list_tools(),
        Command::Install { tool } => orchestrator.install(tool),
        Command::Run { tool, args } => orchestrator.run(tool, args),
        Command::Uninstall { tool } => orchestrator.uninstall(tool),
        Command::Info { tool } => orchestrator.info(tool),
        Command::Doctor => orchestrator.doctor(),
        Command::Clean => orchestrator.clean(),
        Command::Kits => orchestrator.list_kits(),
        Command::KitInfo { kit } => orchestrator.kit_info(kit),
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter =
        format!("quiver_core={level},quiver_cli={level},quiver_domain={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn emit_output(cli: &QuiverCli, outcome: &ExecutionOutcome) -> Result<i32> {
    let mut code = match outcome.status {
        CommandStatus::Ok => 0,
        CommandStatus::UserError => 1,
        CommandStatus::Failure => 2,
    };
    // `run` hands the tool's own exit status through unchanged.
    if let Some(tool_code) = outcome.details.get("exit_code").and_then(Value::as_i64) {
        code = tool_code as i32;
    }

    let style = Style::new(cli.no_color, atty::is(Stream::Stdout));

    if cli.json {
        let payload = json!({
            "status": outcome.status,
            "message": outcome.message,
            "details": outcome.details,
            "exit_code": code,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if !cli.quiet {
        if is_passthrough(&outcome.details) {
            // The tool's output already went to the terminal; only report
            // launch-side problems.
            if code != 0 {
                eprintln!("{}", style.status(&outcome.status, &outcome.message));
            }
        } else {
            println!("{}", style.status(&outcome.status, &outcome.message));
            if let Some(hint) = hint_from_details(&outcome.details) {
                println!("{}", style.info(&format!("Hint: {hint}")));
            }
            if let Some(table) = render_rows(&outcome.details) {
                println!("{table}");
            }
        }
    }

    Ok(code)
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(Value::as_str)
}

fn is_passthrough(details: &Value) -> bool {
    details
        .as_object()
        .and_then(|map| map.get("passthrough"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Renders the `tools` / `kits` arrays of list-style outcomes as aligned
/// rows for human eyes. Everything else stays message-only.
fn render_rows(details: &Value) -> Option<String> {
    if let Some(tools) = details.get("tools").and_then(Value::as_array) {
        let mut lines = Vec::with_capacity(tools.len());
        for tool in tools {
            let name = tool.get("name").and_then(Value::as_str)?;
            let version = tool.get("version").and_then(Value::as_str).unwrap_or("");
            let status = tool.get("status").and_then(Value::as_str).unwrap_or("");
            let marker = if status == "ready" { "✔" } else { "·" };
            lines.push(format!("{marker} {name:<24} {version:<12} {status}"));
        }
        if lines.is_empty() {
            return None;
        }
        return Some(lines.join("\n"));
    }
    if let Some(kits) = details.get("kits").and_then(Value::as_array) {
        let mut lines = Vec::with_capacity(kits.len());
        for kit in kits {
            let name = kit.get("name").and_then(Value::as_str)?;
            let tools = kit.get("tools").and_then(Value::as_u64).unwrap_or(0);
            lines.push(format!("  {name:<24} {tools} tool(s)"));
        }
        if lines.is_empty() {
            return None;
        }
        return Some(lines.join("\n"));
    }
    None
}
