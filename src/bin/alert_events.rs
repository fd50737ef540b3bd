//! alert_events - list the newest persisted proximity alerts, oldest first

use anyhow::{anyhow, Result};
use clap::Parser;

use proximity_kernel::storage::review_entries;
use proximity_kernel::ui::{Ui, UiMode};
use proximity_kernel::SqliteEventStore;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the alert database.
    #[arg(long, env = "PROXIMITY_DB_PATH", default_value = "proximity.db")]
    db_path: String,
    /// Maximum number of events to list; the newest are kept.
    #[arg(long, default_value_t = 1000)]
    limit: usize,
    /// Only list events for this class label.
    #[arg(long)]
    class: Option<String>,
    /// Output file; stdout when omitted.
    #[arg(long)]
    output: Option<String>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, value_enum, default_value_t = UiMode::Auto, value_name = "MODE")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::new(args.ui);
    if !std::path::Path::new(&args.db_path).exists() {
        return Err(anyhow!("alert database {} does not exist", args.db_path));
    }

    let events = {
        let stage = ui.stage("Read alert store");
        let store = SqliteEventStore::open(&args.db_path)?;
        let events = store.read_recent(args.limit, args.class.as_deref())?;
        stage.done();
        events
    };

    let json = serde_json::to_string_pretty(&review_entries(events))?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, format!("{json}\n"))
                .map_err(|e| anyhow!("failed to write {}: {}", path, e))?;
            log::info!("alert listing written to {}", path);
        }
        None => println!("{json}"),
    }
    Ok(())
}
