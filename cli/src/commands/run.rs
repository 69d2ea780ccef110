//! Run commands - start a service or project and follow its events.

use std::future::Future;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use servicedeck_core::{
    Error, ErrorPayload, PortConflict, ProcessStatus, ServiceDeck, StartRequest, StartedService,
    StatusEvent, StreamKind,
};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{info, warn};

use super::{truncate, Context};

/// How following a service ended.
enum Followed {
    Exited(Option<i32>),
    Interrupted,
}

/// `run`: start an ad-hoc command.
pub async fn service(
    ctx: &Context,
    command: String,
    cwd: Option<PathBuf>,
    ports: Vec<u16>,
    kill_conflicts: bool,
) -> Result<()> {
    let cwd = match cwd {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let request = StartRequest::new(command, cwd).with_ports(ports);

    let deck = ctx.deck().await?;
    let mut events = deck.subscribe();
    let started = start_resolving(ctx, &deck, kill_conflicts, || deck.start(request.clone())).await?;

    let followed = follow(ctx, &mut events, &started).await?;
    if let Followed::Interrupted = followed {
        info!(pid = started.process_id, "Interrupted, stopping service");
        deck.stop_service(started.process_id).await?;
    }
    finish(ctx, &deck, &mut events, followed).await
}

/// `project`: start a configured project.
pub async fn project(ctx: &Context, id: &str, kill_conflicts: bool) -> Result<()> {
    let deck = ctx.deck().await?;
    let mut events = deck.subscribe();
    let started = start_resolving(ctx, &deck, kill_conflicts, || deck.start_project(id)).await?;

    let followed = follow(ctx, &mut events, &started).await?;
    if let Followed::Interrupted = followed {
        info!(project = id, "Interrupted, stopping project");
        deck.stop_project(id).await?;
    }
    finish(ctx, &deck, &mut events, followed).await
}

/// Start, optionally freeing occupied ports and retrying once.
async fn start_resolving<F, Fut>(
    ctx: &Context,
    deck: &ServiceDeck,
    kill_conflicts: bool,
    start: F,
) -> Result<StartedService>
where
    F: Fn() -> Fut,
    Fut: Future<Output = servicedeck_core::Result<StartedService>>,
{
    let err = match start().await {
        Ok(started) => return Ok(started),
        Err(e) => e,
    };
    let Error::PortConflict(conflicts) = &err else {
        return Err(err.into());
    };

    if !kill_conflicts {
        if ctx.json {
            ctx.print_json(&ErrorPayload::from(&err))?;
        } else {
            print_conflicts(conflicts);
            eprintln!("Use --kill-conflicts to terminate these processes.");
        }
        bail!("{}", err);
    }

    eprintln!("Terminating {} conflicting process(es)...", conflicts.len());
    let response = deck.kill_port_processes(conflicts).await;
    if !response.success {
        bail!(response
            .error
            .unwrap_or_else(|| "Some ports are still in use".to_string()));
    }

    Ok(start().await?)
}

/// Print events until the instance stops or Ctrl-C is pressed.
async fn follow(
    ctx: &Context,
    events: &mut broadcast::Receiver<StatusEvent>,
    started: &StartedService,
) -> Result<Followed> {
    let mut printer = Printer::new(ctx.json);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                return Ok(Followed::Interrupted);
            }
            received = events.recv() => match received {
                Ok(event) => {
                    printer.print(&event)?;
                    if let StatusEvent::ServiceStopped(stopped) = &event {
                        if stopped.instance_id == started.instance_id {
                            return Ok(Followed::Exited(stopped.exit_code));
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => return Ok(Followed::Exited(None)),
            }
        }
    }
}

/// Flush events produced by the stop, release everything and map the exit code.
async fn finish(
    ctx: &Context,
    deck: &ServiceDeck,
    events: &mut broadcast::Receiver<StatusEvent>,
    followed: Followed,
) -> Result<()> {
    let mut printer = Printer::new(ctx.json);
    loop {
        match events.try_recv() {
            Ok(event) => printer.print(&event)?,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }

    deck.shutdown().await;

    match followed {
        Followed::Exited(Some(code)) if code != 0 => bail!("Service exited with code {}", code),
        _ => Ok(()),
    }
}

struct Printer {
    json: bool,
    last_status: Option<ProcessStatus>,
}

impl Printer {
    fn new(json: bool) -> Self {
        Self {
            json,
            last_status: None,
        }
    }

    fn print(&mut self, event: &StatusEvent) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(event)?);
            return Ok(());
        }

        match event {
            // Monitoring ticks repeat the status; only changes are shown.
            StatusEvent::ProcessStatus(status) => {
                if self.last_status != Some(status.status) {
                    self.last_status = Some(status.status);
                    let ports: Vec<String> = status.ports.iter().map(|p| p.to_string()).collect();
                    eprintln!(
                        "[{}] pid {} ports {}",
                        status.status,
                        status.process_id,
                        if ports.is_empty() {
                            "-".to_string()
                        } else {
                            ports.join(",")
                        }
                    );
                }
            }
            StatusEvent::ServiceOutput(output) => match output.stream {
                StreamKind::Stdout => println!("{}", output.data),
                StreamKind::Stderr => eprintln!("{}", output.data),
                StreamKind::Error => eprintln!("error: {}", output.data),
            },
            StatusEvent::ServiceStopped(stopped) => match stopped.exit_code {
                Some(code) => eprintln!("Service {} stopped (exit code {})", stopped.process_id, code),
                None => eprintln!("Service {} stopped", stopped.process_id),
            },
            StatusEvent::PortConflict(conflict) => print_conflicts(&conflict.conflicts),
        }
        Ok(())
    }
}

fn print_conflicts(conflicts: &[PortConflict]) {
    eprintln!("Ports already in use:");
    for conflict in conflicts {
        eprintln!(
            "  {:<6} PID {:<8} {}",
            conflict.port,
            conflict.pid,
            truncate(&conflict.process_name, 30)
        );
    }
}
