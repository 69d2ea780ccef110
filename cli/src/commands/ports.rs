//! Port commands - inspect listeners and free occupied ports.

use anyhow::{bail, Result};
use servicedeck_core::{PortConflict, PortUsage};

use super::{truncate, Context};

/// `check`: who listens on each port.
pub async fn check(ctx: &Context, ports: &[u16]) -> Result<()> {
    let deck = ctx.deck().await?;
    let usage = deck.check_port_conflicts(ports).await?;

    if ctx.json {
        return ctx.print_json(&usage);
    }

    if usage.is_empty() {
        println!("All ports are free.");
        return Ok(());
    }

    print_usage(&usage);
    Ok(())
}

/// `kill`: terminate every listener on the given ports.
pub async fn kill(ctx: &Context, ports: &[u16]) -> Result<()> {
    let deck = ctx.deck().await?;
    let usage = deck.check_port_conflicts(ports).await?;

    let conflicts: Vec<PortConflict> = usage
        .iter()
        .flat_map(|u| {
            u.processes
                .iter()
                .map(move |p| PortConflict::new(u.port, p.pid, p.name.clone()))
        })
        .collect();

    if conflicts.is_empty() && !ctx.json {
        println!("No processes found on the given ports.");
        return Ok(());
    }

    let response = deck.kill_port_processes(&conflicts).await;

    if ctx.json {
        ctx.print_json(&response)?;
    } else {
        for result in &response.results {
            match &result.error {
                None => println!("Freed port {} (PID {})", result.port, result.pid),
                Some(error) => println!("Port {} not freed: {}", result.port, error),
            }
        }
    }

    if !response.success {
        bail!(response
            .error
            .unwrap_or_else(|| "Some ports are still in use".to_string()));
    }
    Ok(())
}

/// `ports`: every listening socket.
pub async fn list(ctx: &Context) -> Result<()> {
    let deck = ctx.deck().await?;

    if ctx.json {
        return ctx.print_json(&deck.get_active_ports().await?);
    }

    let listeners = deck.get_active_listeners().await?;
    if listeners.is_empty() {
        println!("No listening ports found.");
        return Ok(());
    }

    println!(
        "{:<6} {:<8} {:<20} {:<15} COMMAND",
        "PORT", "PID", "PROCESS", "ADDRESS"
    );
    println!("{}", "-".repeat(80));

    for listener in &listeners {
        println!(
            "{:<6} {:<8} {:<20} {:<15} {}",
            listener.port,
            listener.pid,
            truncate(&listener.process_name, 20),
            truncate(&listener.address, 15),
            truncate(&listener.command, 40)
        );
    }

    println!("\nTotal: {} ports", listeners.len());
    Ok(())
}

fn print_usage(usage: &[PortUsage]) {
    println!("{:<6} {:<8} {:<20} COMMAND", "PORT", "PID", "PROCESS");
    println!("{}", "-".repeat(80));

    for entry in usage {
        for process in &entry.processes {
            println!(
                "{:<6} {:<8} {:<20} {}",
                entry.port,
                process.pid,
                truncate(&process.name, 20),
                truncate(&process.command, 45)
            );
        }
    }
}
