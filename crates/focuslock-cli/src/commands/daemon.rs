//! `daemon`: hosts the enforcement engine.
//!
//! Reads one command per line on stdin and writes one JSON object per line
//! on stdout: the initial snapshot, every observer update, and a reply for
//! each command. Logs go to stderr.

use std::sync::Arc;
use std::time::Duration;

use focuslock_core::{
    AlarmId, Clock, Collaborators, Config, Engine, EngineHandle, LogNavigator, LogSurface,
    ObserverUpdate, RestrictionTerm, SqliteKv, SystemClock, TimerEvent, TokioAlarms,
};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::CliResult;

/// One stdin command.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Foreground(String),
    Alarm(AlarmId),
    Dismiss,
    Add { package: String, minutes: Option<u64> },
    Remove(String),
    Focus(u64),
    Unfocus,
    List,
    Status,
    Quit,
}

fn parse_line(line: &str) -> Result<Line, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let (verb, rest) = words.split_first().ok_or("empty command")?;
    let arg = |index: usize, name: &str| {
        rest.get(index)
            .map(|word| word.to_string())
            .ok_or_else(|| format!("'{verb}' needs <{name}>"))
    };
    let minutes = |value: &str| {
        value
            .parse::<u64>()
            .map_err(|_| format!("'{value}' is not a number of minutes"))
    };

    let parsed = match *verb {
        "fg" => Line::Foreground(arg(0, "package")?),
        "alarm" => Line::Alarm(arg(0, "id")?.parse().map_err(|e| format!("{e}"))?),
        "dismiss" => Line::Dismiss,
        "add" => Line::Add {
            package: arg(0, "package")?,
            minutes: rest.get(1).map(|value| minutes(value)).transpose()?,
        },
        "remove" => Line::Remove(arg(0, "package")?),
        "focus" => Line::Focus(minutes(&arg(0, "minutes")?)?),
        "unfocus" => Line::Unfocus,
        "list" => Line::List,
        "status" => Line::Status,
        "quit" | "exit" => Line::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(parsed)
}

fn emit<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::error!(error = %e, "failed to encode output line"),
    }
}

fn is_tick(update: &ObserverUpdate) -> bool {
    matches!(
        update,
        ObserverUpdate::Event {
            event: TimerEvent::RestrictionTick { .. } | TimerEvent::FocusTick { .. }
        }
    )
}

async fn execute(handle: &EngineHandle, clock: &dyn Clock, line: Line) -> focuslock_core::Result<()> {
    match line {
        Line::Foreground(package) => handle.foreground_changed(package, clock.now())?,
        Line::Alarm(id) => handle.alarm_fired(id)?,
        Line::Dismiss => handle.surface_dismissed()?,
        Line::Add { package, minutes } => {
            let term = minutes.map_or(RestrictionTerm::Permanent, RestrictionTerm::minutes);
            let record = handle.add_restriction(package, term).await?;
            emit(&json!({ "reply": "added", "record": record }));
        }
        Line::Remove(package) => {
            let removed = handle.remove_restriction(&package).await?;
            emit(&json!({ "reply": "removed", "package_id": package, "removed": removed.is_some() }));
        }
        Line::Focus(minutes) => {
            let focus = handle
                .start_focus(Duration::from_secs(minutes.saturating_mul(60)))
                .await?;
            emit(&json!({ "reply": "focus_started", "focus": focus }));
        }
        Line::Unfocus => {
            handle.stop_focus().await?;
            emit(&json!({ "reply": "focus_stopped" }));
        }
        Line::List => {
            let snapshot = handle.snapshot().await?;
            emit(&json!({ "reply": "list", "restrictions": snapshot.restrictions }));
        }
        Line::Status => {
            let status = handle.status().await?;
            emit(&json!({ "reply": "status", "status": status, "summary": status.to_string() }));
        }
        Line::Quit => {}
    }
    Ok(())
}

async fn serve(quiet_ticks: bool) -> CliResult {
    let config = Config::load()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (alarms, fired) = TokioAlarms::new(clock.clone());
    let engine = Engine::new(
        &config,
        Collaborators {
            kv: Arc::new(SqliteKv::open()?),
            alarms: Arc::new(alarms),
            catalog: Arc::new(config.catalog.to_catalog()),
            surface: Arc::new(LogSurface::new()),
            navigator: Arc::new(LogNavigator),
            clock: clock.clone(),
        },
    )?;
    let handle = engine.handle();
    let task = engine.spawn();
    let _forwarder = handle.forward_alarms(fired);

    let mut attachment = handle.attach().await?;
    emit(&json!({ "snapshot": attachment.snapshot() }));
    let printer = tokio::spawn(async move {
        while let Some(update) = attachment.next().await {
            if quiet_ticks && is_tick(&update) {
                continue;
            }
            emit(&update);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Ok(Line::Quit) => break,
            Ok(command) => {
                if let Err(e) = execute(&handle, clock.as_ref(), command).await {
                    emit(&json!({ "error": e.to_string() }));
                }
            }
            Err(message) => emit(&json!({ "error": message })),
        }
    }

    handle.shutdown().await?;
    task.await?;
    printer.await?;
    Ok(())
}

pub fn run(quiet_ticks: bool) -> CliResult {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(quiet_ticks))
}
