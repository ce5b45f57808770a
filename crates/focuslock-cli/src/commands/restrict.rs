use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use focuslock_core::{AppCatalog, CoreError, RestrictionTerm, SyncSnapshot};

use super::{print_json, CliResult, Offline};

#[derive(Subcommand)]
pub enum RestrictAction {
    /// Restrict an app
    Add {
        /// Package id (e.g. "com.example.game")
        package: String,
        #[command(flatten)]
        term: TermArgs,
    },
    /// Lift a restriction
    Remove {
        /// Package id
        package: String,
    },
    /// List active restrictions
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct TermArgs {
    /// Restrict for this many minutes
    #[arg(long)]
    minutes: Option<u64>,
    /// Restrict until an RFC 3339 timestamp
    #[arg(long, value_parser = parse_rfc3339)]
    until: Option<DateTime<Utc>>,
    /// Restrict until removed
    #[arg(long)]
    permanent: bool,
}

impl TermArgs {
    fn term(&self) -> RestrictionTerm {
        match (self.minutes, self.until) {
            (Some(minutes), _) => RestrictionTerm::minutes(minutes),
            (None, Some(end_time)) => RestrictionTerm::Until { end_time },
            (None, None) => RestrictionTerm::Permanent,
        }
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

/// "4m 05s", "1h 02m", "permanent".
pub fn format_remaining(remaining_ms: Option<u64>) -> String {
    let Some(ms) = remaining_ms else {
        return "permanent".into();
    };
    let secs = ms.div_ceil(1000);
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, m, s) => format!("{m}m {s:02}s"),
        (h, m, _) => format!("{h}h {m:02}m"),
    }
}

pub fn run(action: RestrictAction) -> CliResult {
    let now = Utc::now();
    let mut offline = Offline::open(now)?;

    match action {
        RestrictAction::Add { package, term } => {
            let metadata = offline
                .catalog
                .resolve(&package)
                .ok_or_else(|| CoreError::NotFound(format!("package '{package}'")))?;
            let record = term.term().into_record(package, metadata, now)?;
            offline.store.add(record.clone());
            print_json(&record)?;
        }
        RestrictAction::Remove { package } => {
            let removed = offline.store.remove(&package);
            print_json(&serde_json::json!({
                "package_id": package,
                "removed": removed.is_some(),
            }))?;
        }
        RestrictAction::List { json } => {
            let snapshot = SyncSnapshot::new(offline.store.list(now), Default::default(), now);
            if json {
                print_json(&snapshot.restrictions)?;
            } else if snapshot.restrictions.is_empty() {
                println!("no active restrictions");
            } else {
                for view in &snapshot.restrictions {
                    println!(
                        "{}\t{}\t{}",
                        view.record.package_id(),
                        view.record.display_name(),
                        format_remaining(view.remaining_ms)
                    );
                }
            }
        }
    }
    Ok(())
}
