//! Configuration and project listing commands.

use anyhow::{bail, Result};
use servicedeck_core::ports::ProjectStore;
use servicedeck_core::Config;

use super::{truncate, Context};

pub async fn show(ctx: &Context) -> Result<()> {
    let config = ctx.config().await?;

    if ctx.json {
        return ctx.print_json(&config);
    }

    println!("Config file: {}", ctx.store().path().display());
    println!();
    println!("Monitor interval:  {} ms", config.monitor_interval_ms);
    println!("Graceful timeout:  {} ms", config.graceful_timeout_ms);
    println!("Verify timeout:    {} ms", config.verify_timeout_ms);
    println!("Query timeout:     {} ms", config.query_timeout_ms);
    println!("Readiness:         {:?}", config.readiness);
    println!("Port policy:       {:?}", config.port_policy);
    println!("Fallback ports:    {}", join_ports(&config.fallback_ports));
    println!(
        "Critical (extra):  {}",
        if config.critical_processes.is_empty() {
            "none".to_string()
        } else {
            config.critical_processes.join(", ")
        }
    );
    println!("Projects:          {}", config.projects.len());
    Ok(())
}

pub async fn init(ctx: &Context) -> Result<()> {
    let path = ctx.store().path();
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    ctx.store().save(&Config::default()).await?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

pub async fn projects(ctx: &Context) -> Result<()> {
    let deck = ctx.deck().await?;
    let projects = deck.projects().list().await?;

    if ctx.json {
        return ctx.print_json(&projects);
    }

    if projects.is_empty() {
        println!("No projects configured.");
        return Ok(());
    }

    println!("{:<38} {:<16} {:<12} COMMAND", "ID", "NAME", "PORTS");
    println!("{}", "-".repeat(90));
    for project in &projects {
        println!(
            "{:<38} {:<16} {:<12} {}",
            project.id,
            truncate(&project.name, 16),
            truncate(&join_ports(&project.ports), 12),
            truncate(&project.start_command, 30)
        );
    }
    Ok(())
}

fn join_ports(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
