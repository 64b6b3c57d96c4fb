use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::{AttendanceEngine, EngineError, EnrollmentRequest, Scope, SessionRequest};
use rollcall_store::SqliteStore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod notify;

use capture::{CaptureFile, PrecomputedExtractor};
use config::Config;
use notify::{spawn_notifier, LogNotifier, OutboxNotifier};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-matched attendance: enroll, mark, history")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from a single-face capture
    Enroll {
        #[arg(long)]
        name: String,
        /// Roll code (alphanumeric, unique)
        #[arg(long)]
        roll: String,
        #[arg(long)]
        unit: String,
        #[arg(long)]
        term: u8,
        /// Address for absence notices
        #[arg(long)]
        contact: Option<String>,
        /// Capture file holding exactly one face embedding
        #[arg(long)]
        capture: PathBuf,
    },
    /// Replace an identity's stored embedding
    Reenroll {
        id: String,
        #[arg(long)]
        capture: PathBuf,
    },
    /// Remove an identity; recorded sessions are kept
    Remove { id: String },
    /// List enrolled identities
    List {
        #[arg(long)]
        unit: Option<String>,
        #[arg(long)]
        term: Option<u8>,
    },
    /// Record one attendance session from a group capture
    Mark {
        #[arg(long)]
        subject: String,
        /// Session date (YYYY-MM-DD), today when omitted
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        unit: Option<String>,
        #[arg(long)]
        term: Option<u8>,
        #[arg(long)]
        capture: PathBuf,
    },
    /// Attendance history and per-subject statistics for one identity
    History {
        #[arg(required_unless_present = "roll")]
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        roll: Option<String>,
    },
    /// All recorded sessions, newest first
    Logs,
    /// Database location and record counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let store = Arc::new(
        SqliteStore::open(config.db_path())
            .with_context(|| format!("opening database {}", config.db_path().display()))?,
    );
    let mut engine = AttendanceEngine::new(config.engine_config(), store.clone(), store.clone());

    let worker = if config.notify_enabled {
        let (handle, worker) = match &config.notify_outbox {
            Some(path) => spawn_notifier(Box::new(OutboxNotifier::new(path)))?,
            None => spawn_notifier(Box::new(LogNotifier))?,
        };
        engine = engine.with_sink(Arc::new(handle));
        Some(worker)
    } else {
        None
    };

    let outcome = run(&engine, &store, &config, cli.command);

    // The worker only finishes once every handle, including the engine's, is gone.
    drop(engine);
    if let Some(worker) = worker {
        worker.drain(Duration::from_millis(config.notify_grace_ms)).await;
    }

    outcome
}

fn run(engine: &AttendanceEngine, store: &SqliteStore, config: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Enroll {
            name,
            roll,
            unit,
            term,
            contact,
            capture,
        } => {
            let embedding = CaptureFile::load(&capture)?.single_embedding()?;
            let request = EnrollmentRequest {
                name,
                roll_code: roll,
                unit,
                term,
                contact,
            };
            let identity = engine.enroll(&request, embedding)?;
            print_json(&identity)
        }
        Commands::Reenroll { id, capture } => {
            let embedding = CaptureFile::load(&capture)?.single_embedding()?;
            engine.reenroll(&id, embedding)?;
            println!("Re-enrolled {id}");
            Ok(())
        }
        Commands::Remove { id } => {
            engine.remove(&id)?;
            println!("Removed {id}");
            Ok(())
        }
        Commands::List { unit, term } => {
            let roster = engine.roster(&Scope::new(unit, term))?;
            print_json(&roster)
        }
        Commands::Mark {
            subject,
            date,
            unit,
            term,
            capture,
        } => {
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let request = SessionRequest::new(date, subject, Scope::new(unit, term))?;
            let capture = CaptureFile::load(&capture)?;

            let recorded = match engine.mark(&request, &mut PrecomputedExtractor, &capture.faces) {
                Ok(recorded) => recorded,
                Err(EngineError::NoFaceDetected) => anyhow::bail!("no faces detected in the capture"),
                Err(err) => return Err(err.into()),
            };

            print_json(&MarkSummary {
                session_id: &recorded.session_id,
                date: recorded.session.date,
                subject: &recorded.session.subject,
                faces_detected: recorded.faces.detected,
                faces_processed: recorded.faces.processed,
                total_in_scope: recorded.total_in_scope(),
                present_count: recorded.present_count(),
                absent_count: recorded.absent_count(),
                present: &recorded.present,
                roster: &recorded.roster,
            })
        }
        Commands::History { id, roll } => {
            let id = match (id, roll) {
                (Some(id), _) => id,
                (None, Some(roll)) => {
                    engine
                        .identity_by_roll_code(&roll)?
                        .with_context(|| format!("no identity with roll code {roll}"))?
                        .id
                }
                (None, None) => anyhow::bail!("an identity id or --roll is required"),
            };
            print_json(&engine.history(&id)?)
        }
        Commands::Logs => print_json(&engine.session_log()?),
        Commands::Status => {
            let (identities, embeddings, sessions) = store.counts()?;
            println!("database:    {}", config.db_path().display());
            println!("identities:  {identities}");
            println!("embeddings:  {embeddings}");
            println!("sessions:    {sessions}");
            println!("threshold:   {:.2}", config.similarity_threshold);
            println!(
                "notify:      {}",
                match (config.notify_enabled, &config.notify_outbox) {
                    (false, _) => "disabled".to_string(),
                    (true, None) => "log".to_string(),
                    (true, Some(path)) => format!("outbox {}", path.display()),
                }
            );
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct MarkSummary<'a> {
    session_id: &'a str,
    date: NaiveDate,
    subject: &'a str,
    faces_detected: usize,
    faces_processed: usize,
    total_in_scope: usize,
    present_count: usize,
    absent_count: usize,
    present: &'a [rollcall_core::recorder::PresentIdentity],
    roster: &'a [rollcall_core::recorder::RosterEntry],
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
