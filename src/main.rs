use clap::Parser;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use watchpoint::{
    cli::{Cli, OutputFormat},
    Event, FsEvent, PathWatcher,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();

    let config = cli.resolve_config()?;
    if let Err(err) = config.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    let watch_path = cli.get_watch_path();
    let events = cli.event_mask();
    tracing::info!(
        "Watching {} for {}{}",
        watch_path.display(),
        category_names(events),
        if config.recursive { " (recursive)" } else { "" }
    );

    let watcher = PathWatcher::new(&watch_path)?;
    let subscription = watcher.subscribe(events, config.recursive, config.channel_capacity)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) {
        match subscription.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => print_event(&event, &cli.output)?,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    watcher.unsubscribe(subscription)?;
    tracing::info!("Stopped watching {}", watch_path.display());
    Ok(())
}

fn print_event(event: &FsEvent, output: &OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Text => println!("{:<8} {}", category_names(event.event), event.path.display()),
    }
    Ok(())
}

fn category_names(event: Event) -> String {
    event
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}
