use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use chrono_tz::Tz;
use duet_auth::{StoredTokenProvider, TokenProvider, TokenStore};
use duet_calendar::{Event, EventTime, LoadStatus, RangeKind, SqliteBlobStore, SyncController};

#[tokio::main]
async fn main() -> Result<()> {
    duet_core::init()?;

    let (config, _) = duet_core::Config::load_validated()?;
    tracing::info!("Config directory: {}", config.config_dir.display());

    let tokens: Arc<dyn TokenProvider> =
        Arc::new(StoredTokenProvider::new(TokenStore::new(config.tokens_dir())));
    let linked = tokens.linked_accounts();
    if linked.is_empty() {
        println!(
            "No linked accounts. Place token files in {}",
            config.tokens_dir().display()
        );
    }

    let store = SqliteBlobStore::new(config.cache_db_path())
        .with_context(|| format!("Failed to open cache at {}", config.cache_db_path().display()))?;
    let sync = SyncController::from_config(&config, tokens, Arc::new(store))?;
    let tz = sync.settings().tz;

    let today = Utc::now().with_timezone(&tz).date_naive();
    let outcome = sync.load_range(RangeKind::Week, today).await;

    if let Some(failure) = &outcome.failure {
        eprintln!("{}", failure.user_message());
    } else if outcome.status == LoadStatus::PartialLoaded {
        eprintln!("Some calendars could not be loaded");
    }

    println!("Week of {}", outcome.range.start.format("%A %-d %B %Y"));
    for day in outcome.range.days() {
        println!("\n{}", day.format("%a %-d %b"));
        let mut empty = true;
        for kind in &linked {
            for event in sync.events_for_day(day, Some(*kind)) {
                println!("  {:<12} [{}] {}", time_label(&event, tz), kind, event.title);
                empty = false;
            }
        }
        if empty {
            println!("  -");
        }
    }

    sync.prefetch().cancel();
    sync.cache().flush().await;
    Ok(())
}

fn time_label(event: &Event, tz: Tz) -> String {
    match (event.start, event.end) {
        (Some(EventTime::DateTime(start)), Some(EventTime::DateTime(end))) => format!(
            "{}-{}",
            start.with_timezone(&tz).format("%H:%M"),
            end.with_timezone(&tz).format("%H:%M")
        ),
        _ if event.is_all_day() => "all day".to_string(),
        _ => String::new(),
    }
}
