use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::{AttendanceRecord, AttendanceStore, Config, EmbeddingExtractor, FaceExtractor, Person};
use rollcall_store::SqliteStore;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

mod client;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a photo
    Enroll {
        /// Unique person id (e.g. student number)
        id: String,
        #[arg(short, long)]
        name: String,
        /// Class or team
        #[arg(short, long, default_value = "")]
        group: String,
        /// Photo containing the person's face
        #[arg(short, long)]
        photo: PathBuf,
    },
    /// List enrolled people
    List,
    /// Remove an enrolled person
    Remove {
        id: String,
    },
    /// Remove every enrolled person
    Clear,
    /// Show attendance records
    History {
        /// Only this day (YYYY-MM-DD)
        #[arg(short, long)]
        date: Option<NaiveDate>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete all attendance records
    ClearHistory,
    /// Start a recognition session on the daemon
    Start,
    /// Stop the running recognition session
    Stop,
    /// Show daemon session status
    Status,
    /// Follow attendance events until the session ends
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll {
            id,
            name,
            group,
            photo,
        } => enroll(id, name, group, photo)?,
        Commands::List => {
            let people = open_store()?.people()?;
            if people.is_empty() {
                println!("No one enrolled");
            }
            for p in people {
                println!(
                    "{:<16} {:<28} {:<10} {}",
                    p.id,
                    p.name,
                    p.group,
                    p.enrolled_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Remove { id } => {
            if open_store()?.remove_person(&id)? {
                println!("Removed {id}");
            } else {
                anyhow::bail!("{id} is not enrolled");
            }
        }
        Commands::Clear => {
            let removed = open_store()?.clear_people()?;
            println!("Removed {removed} enrolled people");
        }
        Commands::History { date, json } => {
            let store = open_store()?;
            let records = match date {
                Some(date) => store.records_for_date(date)?,
                None => store.all_records()?,
            };
            let names: HashMap<String, String> = store
                .people()?
                .into_iter()
                .map(|p| (p.id, p.name))
                .collect();
            if json {
                println!("{}", history_json(&records, &names)?);
            } else if records.is_empty() {
                println!("No attendance records");
            } else {
                for line in history_table(&records, &names) {
                    println!("{line}");
                }
            }
        }
        Commands::ClearHistory => {
            let removed = open_store()?.delete_all_attendance()?;
            println!("Deleted {removed} attendance records");
        }
        Commands::Start => client::start().await?,
        Commands::Stop => client::stop().await?,
        Commands::Status => client::status().await?,
        Commands::Watch => client::watch().await?,
    }

    Ok(())
}

fn open_store() -> Result<SqliteStore> {
    let config = Config::load()?;
    SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))
}

fn enroll(id: String, name: String, group: String, photo: PathBuf) -> Result<()> {
    let config = Config::load()?;
    let gray = image::open(&photo)
        .with_context(|| format!("failed to read {}", photo.display()))?
        .to_luma8();

    let mut extractor =
        FaceExtractor::load(&config.scrfd_model_path(), &config.facenet_model_path())
            .context("failed to load face models")?;
    let Some(embedding) = extractor.extract(&gray)? else {
        anyhow::bail!("no face found in {}", photo.display());
    };

    let person = Person {
        id,
        name,
        group,
        photo_path: Some(photo.to_string_lossy().into_owned()),
        enrolled_at: Local::now(),
    };
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    store.enroll(&person, &embedding)?;
    tracing::info!(id = %person.id, dim = embedding.dim(), "person enrolled");
    println!("Enrolled {} ({})", person.name, person.id);
    Ok(())
}

#[derive(Serialize)]
struct HistoryRow<'a> {
    #[serde(flatten)]
    record: &'a AttendanceRecord,
    name: Option<&'a str>,
}

fn history_json(records: &[AttendanceRecord], names: &HashMap<String, String>) -> Result<String> {
    let rows: Vec<HistoryRow<'_>> = records
        .iter()
        .map(|record| HistoryRow {
            record,
            name: names.get(&record.person_id).map(String::as_str),
        })
        .collect();
    Ok(serde_json::to_string_pretty(&rows)?)
}

fn history_table(records: &[AttendanceRecord], names: &HashMap<String, String>) -> Vec<String> {
    records
        .iter()
        .map(|r| {
            let name = names.get(&r.person_id).map_or("(removed)", String::as_str);
            format!(
                "{} {}  {:<16} {:<28} {:.3}",
                r.date, r.time, r.person_id, name, r.confidence
            )
        })
        .collect()
}
