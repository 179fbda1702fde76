use anyhow::Result;
use colored::Colorize;
use lifecycle::bus::channels;
use lifecycle::components::builtin::WorkspaceRegistry;
use lifecycle::prelude::*;
use lifecycle::{SERVER_NAME, VERSION as LIB_VERSION};
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use serde_json::json;
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct ShellHighlighter;

impl Highlighter for ShellHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            Cow::Owned(format!("{} {}", command.yellow().bold(), rest.yellow()))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner(server_name: &str) {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    let rule = "-".repeat(79);
    println!("{}", rule.dimmed());
    println!("  {}  {}", "phaseshell".cyan().bold(), server_name.cyan());
    println!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    let license_blurb = "
    This software is provided 'as is', without warranty of any kind.
    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.
    ";
    println!("{}", license_blurb.dimmed());
    println!("{}", rule.dimmed());
}

/// Prints phase reports while the shared flag is set.
fn spawn_report_listener(server: &Server, is_watching: Arc<AtomicBool>) {
    let mut reports = server.subscribe_reports();
    tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            if !is_watching.load(Ordering::Relaxed) {
                continue;
            }
            let line = match &report.kind {
                ReportKind::Dispatched { order } => {
                    format!("dispatching to [{}]", order.join(", "))
                }
                ReportKind::ComponentSucceeded { component, payload } => {
                    format!("{} {} {}", component, "ok".green(), payload)
                }
                ReportKind::ComponentFailed { failure } => {
                    format!("{} {}", failure.sender, failure.to_string().red())
                }
                ReportKind::Completed { state } => format!("completed, server is {}", state),
                ReportKind::Failed { state, reason } => {
                    format!("failed ({}), server is {}", reason.red(), state)
                }
            };
            println!(
                "<-- [{} {}] {}",
                report.at.format("%H:%M:%S%.3f"),
                report.phase.as_str().cyan(),
                line
            );
        }
    });
}

fn print_outcome(phase: Phase, outcome: Result<(), LifecycleError>, server: &Server) {
    match outcome {
        Ok(()) => println!("--> {} done; server is {}.", phase, server.state()),
        Err(err) => {
            println!("--> {} [{}] {}", "error".red().bold(), err.as_label(), err);
            if let LifecycleError::Phase(failure) = &err {
                println!("    root cause in '{}'", failure.root_sender());
            }
        }
    }
}

fn print_components(server: &Server) {
    let graph = server.registry().dependency_graph();
    println!("Registered Components:");
    for id in graph.ids() {
        let start = graph.dependencies(id, Phase::Start);
        let stop = graph.dependencies(id, Phase::Stop);
        println!(
            "  {:<20} start after [{}]  stop after [{}]",
            id.cyan(),
            start.join(", "),
            stop.join(", ")
        );
    }
}

async fn lookup(server: &Server, path: &str) {
    let request = server
        .bus()
        .channel(channels::WORKSPACE)
        .request(WorkspaceRegistry::LOOKUP, Message::Data(json!(path)));
    match request.await {
        Ok(reply) => println!("--> {}", reply.into_value()),
        Err(err) => println!("--> {} {}", "error".red().bold(), err),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = env::args_os().nth(1).map(PathBuf::from);
    let config = ServerConfig::load(config_path.as_deref())?;
    print_banner(&config.server_name);

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let server = Server::new(config, &ComponentCatalog::builtin())?;
    if server.config().token_secret.is_none() {
        info!("No token secret configured; 'start' will fail in token-factory.");
    }

    // Shared flag for the report listener.
    let is_watching = Arc::new(AtomicBool::new(true));
    spawn_report_listener(&server, is_watching.clone());

    let mut rl = Editor::new()?;
    rl.set_helper(Some(ShellHighlighter));

    println!(
        "{} is {}. Type 'help' for commands or 'exit' to quit.",
        SERVER_NAME.cyan(),
        server.state()
    );

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();
                let Some(command) = args.first() else {
                    continue;
                };

                match *command {
                    "init" | "start" | "stop" | "destroy" => {
                        if let Ok(phase) = command.parse::<Phase>() {
                            let outcome = server.run(phase).await;
                            print_outcome(phase, outcome, &server);
                        }
                    }
                    "restart" => {
                        let outcome = server.restart().await;
                        print_outcome(Phase::Start, outcome, &server);
                    }
                    "status" => {
                        println!("Server '{}' is {}.", server.config().server_name, server.state());
                        println!("  components: {}", server.registry().len());
                        println!("  teardown:   {:?}", server.config().lifecycle.teardown);
                    }
                    "list" => print_components(&server),
                    "order" => match args.get(1).map(|p| p.parse::<Phase>()) {
                        Some(Ok(phase)) => match server.dispatch_order(phase) {
                            Ok(order) => println!("--> {}: {}", phase, order.join(" -> ")),
                            Err(err) => println!("--> {} {}", "error".red().bold(), err),
                        },
                        Some(Err(_)) => println!("Error: phase must be one of init, start, stop, destroy."),
                        None => println!("Usage: order <PHASE>"),
                    },
                    "channels" => {
                        for name in server.bus().channel_names() {
                            let count = server.bus().channel(&name).subscription_count();
                            println!("  {:<12} {} subscription(s)", name.cyan(), count);
                        }
                    }
                    "watch" => match args.get(1) {
                        Some(&"on") => {
                            is_watching.store(true, Ordering::Relaxed);
                            println!("--> Printing phase reports.");
                        }
                        Some(&"off") => {
                            is_watching.store(false, Ordering::Relaxed);
                            println!("--> Phase reports muted.");
                        }
                        _ => println!("Usage: watch on|off"),
                    },
                    "lookup" => match args.get(1) {
                        Some(path) => lookup(&server, path).await,
                        None => println!("Usage: lookup <PATH>"),
                    },
                    "help" => {
                        println!("Available commands:");
                        println!("  init | start | stop | destroy  - Runs one lifecycle phase.");
                        println!("  restart                        - Runs stop, then start.");
                        println!("  status                         - Shows the server state.");
                        println!("  list                           - Shows components and their dependencies.");
                        println!("  order <PHASE>                  - Shows the dispatch order of a phase.");
                        println!("  channels                       - Shows the open bus channels.");
                        println!("  watch on|off                   - Toggles printing of phase reports.");
                        println!("  lookup <PATH>                  - Asks the workspace registry about a path.");
                        println!("  exit                           - Quits the shell.");
                    }
                    "exit" => break,
                    _ => println!("Unknown command: '{}'. Type 'help'.", line),
                }
            }
            Err(_) => {
                println!("Exiting phaseshell...");
                break;
            }
        }
    }

    // Leave the components in a clean state on the way out.
    if matches!(server.state(), ServerState::Started | ServerState::Failed(Phase::Start)) {
        server.stop().await.ok();
    }
    if !matches!(server.state(), ServerState::Destroyed | ServerState::Uninitialized) {
        server.destroy().await.ok();
    }
    Ok(())
}
