use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use ipbx_api::{ExtensionDirectory, InsidePbxClient, NewPhonebookEntry};
use ipbx_core::{is_valid_phone_number_default, QueueSelection, TracingObserver};
use ipbx_transport::PbxConfig;
use ipbx_webhook::AppState;
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ipbx")]
#[command(about = "InsidePBX call-log, abandoned-call and phonebook client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Queue calls the caller hung up on before reaching an agent
    Abandoned {
        #[arg(long = "queue", required = true)]
        queues: Vec<String>,
        /// forward_name of the after-hours playback
        #[arg(long = "after-hours")]
        after_hours: Vec<String>,
        #[command(flatten)]
        window: WindowArgs,
    },
    CallLog {
        #[command(flatten)]
        window: WindowArgs,
    },
    Extensions {
        #[arg(long)]
        numbers_only: bool,
    },
    Phonebook {
        #[command(subcommand)]
        command: PhonebookCommand,
    },
    /// Receive real-time call callbacks
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Subcommand)]
enum PhonebookCommand {
    List,
    Create(EntryArgs),
    Update {
        #[arg(long)]
        id: u64,
        #[command(flatten)]
        entry: EntryArgs,
    },
    Delete {
        #[arg(long)]
        id: u64,
    },
}

#[derive(Debug, Args)]
struct WindowArgs {
    /// RFC 3339 start; defaults to 24 hours before --to
    #[arg(long)]
    from: Option<DateTime<Utc>>,
    /// RFC 3339 end; defaults to now
    #[arg(long)]
    to: Option<DateTime<Utc>>,
}

impl WindowArgs {
    fn resolve(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self.to.unwrap_or(now);
        let start = self.from.unwrap_or(end - Duration::hours(24));
        if start > end {
            bail!("--from {start} is after --to {end}");
        }
        Ok((start, end))
    }
}

#[derive(Debug, Args)]
struct EntryArgs {
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    phone: String,
}

impl From<EntryArgs> for NewPhonebookEntry {
    fn from(args: EntryArgs) -> Self {
        if !is_valid_phone_number_default(&args.phone) {
            warn!(phone = %args.phone, "phone number does not look like a 10-15 digit number");
        }
        Self {
            first_name: args.first_name,
            last_name: args.last_name,
            display_name: args.display_name,
            phone_number: args.phone,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(client: InsidePbxClient, command: Commands) -> Result<()> {
    match command {
        Commands::Abandoned {
            queues,
            after_hours,
            window,
        } => {
            let (start, end) = window.resolve(Utc::now())?;
            let selection = QueueSelection::new(queues).with_after_hours(after_hours);
            let report = client
                .abandoned_calls(&selection, start, end, &TracingObserver)
                .await?;
            print_json(&report)?;
        }
        Commands::CallLog { window } => {
            let (start, end) = window.resolve(Utc::now())?;
            let batch = client.call_log(start, end).await?;
            if batch.skipped > 0 {
                warn!(skipped = batch.skipped, "some call-log entries were malformed");
            }
            print_json(&batch.records)?;
        }
        Commands::Extensions { numbers_only } => {
            if numbers_only {
                let mut numbers: Vec<String> = client.list_extensions().await?.into_iter().collect();
                numbers.sort();
                print_json(&numbers)?;
            } else {
                print_json(&client.extensions().await?)?;
            }
        }
        Commands::Phonebook { command } => match command {
            PhonebookCommand::List => print_json(&client.phonebook().await?)?,
            PhonebookCommand::Create(entry) => {
                client.create_phonebook_entry(&entry.into()).await?;
                eprintln!("phonebook entry created");
            }
            PhonebookCommand::Update { id, entry } => {
                client.update_phonebook_entry(id, &entry.into()).await?;
                eprintln!("phonebook entry {id} replaced");
            }
            PhonebookCommand::Delete { id } => {
                client.delete_phonebook_entry(id).await?;
                eprintln!("phonebook entry {id} deleted");
            }
        },
        Commands::Serve { port } => serve(port).await?,
    }
    Ok(())
}

async fn serve(port: Option<u16>) -> Result<()> {
    let port = port
        .or_else(|| {
            std::env::var("IPBX_WEBHOOK_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(8080);
    let state = AppState::from_env().context("loading callback receiver configuration")?;
    ipbx_webhook::serve(state, port).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Serve { port } = cli.command {
        return serve(port).await;
    }
    let config = PbxConfig::from_env().context("loading PBX configuration")?;

    let client = InsidePbxClient::new(config)?;
    run(client, cli.command).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text)
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn abandoned_requires_at_least_one_queue() {
        assert!(Cli::try_parse_from(["ipbx", "abandoned"]).is_err());
        let cli = Cli::try_parse_from([
            "ipbx",
            "abandoned",
            "--queue",
            "Sales",
            "--queue",
            "Support",
            "--after-hours",
            "Closed",
            "--from",
            "2024-01-15T00:00:00Z",
        ])
        .unwrap();
        match cli.command {
            Commands::Abandoned {
                queues,
                after_hours,
                window,
            } => {
                assert_eq!(queues, vec!["Sales", "Support"]);
                assert_eq!(after_hours, vec!["Closed"]);
                assert_eq!(window.from, Some(ts("2024-01-15T00:00:00Z")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn window_defaults_to_last_day_and_rejects_inverted_range() {
        let now = ts("2024-01-16T12:00:00Z");
        let window = WindowArgs { from: None, to: None };
        assert_eq!(
            window.resolve(now).unwrap(),
            (ts("2024-01-15T12:00:00Z"), now)
        );
        let inverted = WindowArgs {
            from: Some(ts("2024-01-17T00:00:00Z")),
            to: Some(now),
        };
        assert!(inverted.resolve(now).is_err());
    }

    #[test]
    fn phonebook_update_parses_id_and_entry() {
        let cli = Cli::try_parse_from([
            "ipbx",
            "phonebook",
            "update",
            "--id",
            "7",
            "--first-name",
            "Ion",
            "--last-name",
            "Popescu",
            "--display-name",
            "Ion P.",
            "--phone",
            "+40 721 123 456",
        ])
        .unwrap();
        let Commands::Phonebook {
            command: PhonebookCommand::Update { id, entry },
        } = cli.command
        else {
            panic!("expected phonebook update");
        };
        assert_eq!(id, 7);
        let entry: NewPhonebookEntry = entry.into();
        assert_eq!(entry.phone_number, "+40 721 123 456");
    }
}
