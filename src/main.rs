use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hookflow::config::Config;
use hookflow::dispatch::{Delivery, Dispatcher};
use hookflow::notify_log::NotificationLog;
use hookflow::scheduler::Scheduler;
use hookflow::store::FlowStore;

#[derive(Parser)]
#[command(name = "hookflow")]
#[command(about = "Watch-and-notify automation engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the watcher (polling loop)
    Run,
    /// Manage notification flows
    Flows {
        #[command(subcommand)]
        action: FlowActions,
    },
    /// Render and deliver one notification immediately
    Test {
        /// Flow name
        name: String,
    },
    /// Inject an inbound event for an on-incoming flow
    Incoming {
        /// Flow name
        name: String,
        /// JSON event payload
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Manage user variables
    Vars {
        #[command(subcommand)]
        action: VarActions,
    },
    /// Show recent delivered notifications
    Sent {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum FlowActions {
    /// List all flows
    List,
    /// Show one flow in full
    Show {
        /// Flow name
        name: String,
    },
    /// Activate a flow
    Enable {
        /// Flow name
        name: String,
    },
    /// Deactivate a flow
    Disable {
        /// Flow name
        name: String,
    },
    /// Duplicate a flow (fresh copy, no trigger history)
    Duplicate {
        /// Flow name
        name: String,
    },
    /// Delete a flow
    Delete {
        /// Flow name
        name: String,
    },
}

#[derive(Subcommand)]
enum VarActions {
    /// List user variables
    List,
    /// Set a user variable (value parsed as JSON, else kept as a string)
    Set {
        name: String,
        value: String,
    },
    /// Remove a user variable
    Unset {
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hookflow=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => cmd_run().await?,
        Commands::Flows { action } => match action {
            FlowActions::List => cmd_flows_list().await?,
            FlowActions::Show { name } => cmd_flows_show(&name).await?,
            FlowActions::Enable { name } => cmd_flows_set_active(&name, true).await?,
            FlowActions::Disable { name } => cmd_flows_set_active(&name, false).await?,
            FlowActions::Duplicate { name } => cmd_flows_duplicate(&name).await?,
            FlowActions::Delete { name } => cmd_flows_delete(&name).await?,
        },
        Commands::Test { name } => cmd_test(&name).await?,
        Commands::Incoming { name, input } => cmd_incoming(&name, input.as_deref()).await?,
        Commands::Vars { action } => match action {
            VarActions::List => cmd_vars_list().await?,
            VarActions::Set { name, value } => cmd_vars_set(&name, &value).await?,
            VarActions::Unset { name } => cmd_vars_unset(&name).await?,
        },
        Commands::Sent { limit } => cmd_sent(limit).await?,
    }

    Ok(())
}

fn open_store() -> (Arc<FlowStore>, NotificationLog) {
    let config = Config::load();
    (
        Arc::new(FlowStore::open(&config.store_path)),
        NotificationLog::open(&config.notification_log_path),
    )
}

fn make_scheduler() -> Scheduler {
    let (store, log) = open_store();
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), log));
    Scheduler::new(store, dispatcher)
}

async fn cmd_run() -> anyhow::Result<()> {
    let config = Config::load();
    println!("hookflow watcher starting");
    println!("  store: {}", config.store_path.display());
    println!("Press Ctrl+C to stop");

    let scheduler = make_scheduler();
    tokio::select! {
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down gracefully...");
        }
    }
    Ok(())
}

async fn cmd_flows_list() -> anyhow::Result<()> {
    let (store, _) = open_store();
    let doc = store.load().await?;

    if doc.flows.is_empty() {
        println!("No flows configured.");
        return Ok(());
    }

    println!("{:<30} {:<12} {:<8} {:<20}", "NAME", "TRIGGER", "ACTIVE", "LAST VALUE");
    println!("{}", "-".repeat(72));
    for flow in &doc.flows {
        println!(
            "{:<30} {:<12} {:<8} {:<20}",
            flow.name,
            flow.trigger_type.to_string(),
            if flow.active { "yes" } else { "no" },
            flow.last_value.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_flows_show(name: &str) -> anyhow::Result<()> {
    let (store, _) = open_store();
    let doc = store.load().await?;
    let flow = doc.flow(name).ok_or_else(|| anyhow::anyhow!("Flow not found: {}", name))?;
    println!("{}", serde_json::to_string_pretty(flow)?);
    Ok(())
}

async fn cmd_flows_set_active(name: &str, active: bool) -> anyhow::Result<()> {
    let (store, _) = open_store();
    if store.set_flow_active(name, active).await? {
        println!("✓ Flow '{}' {}", name, if active { "enabled" } else { "disabled" });
    } else {
        anyhow::bail!("Flow not found: {}", name);
    }
    Ok(())
}

async fn cmd_flows_duplicate(name: &str) -> anyhow::Result<()> {
    let (store, _) = open_store();
    match store.duplicate_flow(name).await? {
        Some(new_name) => println!("✓ Flow '{}' duplicated as '{}'", name, new_name),
        None => anyhow::bail!("Flow not found: {}", name),
    }
    Ok(())
}

async fn cmd_flows_delete(name: &str) -> anyhow::Result<()> {
    let (store, _) = open_store();
    if store.delete_flow(name).await? {
        println!("✓ Flow '{}' deleted", name);
    } else {
        anyhow::bail!("Flow not found: {}", name);
    }
    Ok(())
}

async fn cmd_test(name: &str) -> anyhow::Result<()> {
    let (store, log) = open_store();
    let doc = store.load().await?;
    let flow = doc
        .flow(name)
        .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", name))?
        .clone();

    let dispatcher = Dispatcher::new(store, log);
    match dispatcher.send(&flow.message_template, &flow, None).await? {
        Delivery::Sent => println!("✓ Test notification delivered for '{}'", name),
        Delivery::Suppressed => {
            println!("Condition not met for '{}'; nothing sent", name)
        }
    }
    Ok(())
}

async fn cmd_incoming(name: &str, input: Option<&str>) -> anyhow::Result<()> {
    let payload: serde_json::Value = match input {
        Some(raw) => serde_json::from_str(raw)?,
        None => serde_json::json!({}),
    };

    let scheduler = make_scheduler();
    match scheduler.deliver_incoming(name, payload).await? {
        Delivery::Sent => println!("✓ Event delivered for '{}'", name),
        Delivery::Suppressed => println!("Condition not met for '{}'; nothing sent", name),
    }
    Ok(())
}

async fn cmd_vars_list() -> anyhow::Result<()> {
    let (store, _) = open_store();
    let doc = store.load().await?;

    if doc.user_variables.is_empty() {
        println!("No user variables set.");
        return Ok(());
    }
    for (name, value) in &doc.user_variables {
        println!("{} = {}", name, value);
    }
    Ok(())
}

async fn cmd_vars_set(name: &str, value: &str) -> anyhow::Result<()> {
    let parsed: serde_json::Value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));

    let (store, _) = open_store();
    store.set_user_variable(name, Some(parsed)).await?;
    println!("✓ Variable '{}' saved", name);
    Ok(())
}

async fn cmd_vars_unset(name: &str) -> anyhow::Result<()> {
    let (store, _) = open_store();
    store.set_user_variable(name, None).await?;
    println!("✓ Variable '{}' removed", name);
    Ok(())
}

async fn cmd_sent(limit: usize) -> anyhow::Result<()> {
    let (_, log) = open_store();
    let entries = log.entries()?;

    if entries.is_empty() {
        println!("No notifications sent yet.");
        return Ok(());
    }

    println!("{:<20} {:<24} MESSAGE", "TIMESTAMP", "FLOW");
    println!("{}", "-".repeat(70));
    for entry in entries.iter().rev().take(limit) {
        let mut message = entry.message.replace('\n', " ");
        if message.chars().count() > 60 {
            message = message.chars().take(60).collect::<String>() + "...";
        }
        println!("{:<20} {:<24} {}", entry.timestamp, entry.flow_name, message);
    }
    Ok(())
}
