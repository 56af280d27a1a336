use calfeed::components::ics_feed::QueryRequest;
use calfeed::error::Error;
use calfeed::utils::time::parse_instant;
use calfeed::{shutdown, startup};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "calfeed", version, about = "Aggregate and expand iCalendar feeds")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print occurrences from the configured feeds as JSON
    Query {
        /// Only this source (case-insensitive)
        #[arg(long)]
        source: Option<String>,
        /// Window start: RFC 3339, YYYY-MM-DD or YYYY-MM-DDTHH:MM
        #[arg(long)]
        from: Option<String>,
        /// Window end, same formats as --from
        #[arg(long)]
        to: Option<String>,
        /// Substring to look for in summary, description or location
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Drop cached documents, then fetch them again
    Refresh {
        #[arg(long)]
        source: Option<String>,
        /// Only invalidate
        #[arg(long)]
        no_repopulate: bool,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    startup::init_logging()?;

    info!("Starting calfeed");

    // Load configuration
    let config = startup::load_config()?;
    let tz = config.tz()?;
    let (engine, cache) = startup::build_engine(&config)?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown::handle_signals(cancel.clone()));

    let output = match cli.command {
        Commands::Query {
            source,
            from,
            to,
            search,
            limit,
        } => {
            let request = QueryRequest {
                source,
                from: from.as_deref().map(|f| parse_instant(f, tz)).transpose()?,
                to: to.as_deref().map(|t| parse_instant(t, tz)).transpose()?,
                search,
                limit,
            };
            let result = engine.query(&request, &cancel).await?;
            serde_json::to_string_pretty(&result).map_err(Error::from)?
        }
        Commands::Refresh {
            source,
            no_repopulate,
        } => {
            let report = tokio::select! {
                report = engine.refresh(source.as_deref(), !no_repopulate) => report?,
                _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
            };
            serde_json::to_string_pretty(&report).map_err(Error::from)?
        }
    };

    println!("{}", output);

    // Lets the signal task exit
    cancel.cancel();
    cache.shutdown().await?;

    Ok(())
}
