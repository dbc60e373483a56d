use std::path::PathBuf;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use crate::config::WatchpointConfig;
use crate::event::Event;

#[derive(Parser)]
#[command(name = "watchpoint")]
#[command(version = "0.1.0")]
#[command(about = "Subscribe to change events of a directory and print them as they arrive")]
#[command(long_about = "watchpoint registers a subscriber for the selected event categories on one directory, optionally including its whole subtree, and prints every delivered event. Slow consumers lose events instead of stalling the watcher.")]
pub struct Cli {
    /// Directory to watch for changes
    #[arg(value_name = "PATH", help = "Path to watch (defaults to current directory)")]
    pub path: Option<PathBuf>,

    /// Event categories to subscribe to
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "create,write,remove,rename",
        help = "Event categories (create,write,remove,rename,metadata)"
    )]
    pub events: Vec<EventCategory>,

    /// Include changes anywhere below PATH
    #[arg(short, long, help = "Watch the whole subtree")]
    pub recursive: bool,

    /// Queue size of the subscriber
    #[arg(long, help = "Events to buffer before dropping (overrides config)")]
    pub capacity: Option<usize>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE", help = "Configuration file")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "text", help = "Output format")]
    pub output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventCategory {
    Create,
    Write,
    Remove,
    Rename,
    Metadata,
}

impl EventCategory {
    pub fn mask(self) -> Event {
        match self {
            EventCategory::Create => Event::CREATE,
            EventCategory::Write => Event::WRITE,
            EventCategory::Remove => Event::REMOVE,
            EventCategory::Rename => Event::RENAME,
            EventCategory::Metadata => Event::METADATA,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// One human readable line per event
    Text,
    /// JSON output for scripting
    Json,
}

impl Cli {
    pub fn get_watch_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    pub fn event_mask(&self) -> Event {
        self.events
            .iter()
            .fold(Event::empty(), |mask, category| mask | category.mask())
    }

    /// Config file (or environment) with command line flags applied on top.
    pub fn resolve_config(&self) -> Result<WatchpointConfig> {
        let config = match &self.config {
            Some(path) => WatchpointConfig::load(path)?,
            None => WatchpointConfig::default(),
        };
        let mut config = config.with_env_overrides();

        if let Some(capacity) = self.capacity {
            config.channel_capacity = capacity;
        }
        if self.recursive {
            config.recursive = true;
        }
        Ok(config)
    }

    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
            .init();
    }

    pub fn validate(&self) -> Result<(), String> {
        let path = self.get_watch_path();

        if !path.exists() {
            return Err(format!("Path does not exist: {}", path.display()));
        }

        if !path.is_dir() {
            return Err(format!("Path is not a directory: {}", path.display()));
        }

        if self.events.is_empty() {
            return Err("At least one event category is required".to_string());
        }

        if self.capacity == Some(0) {
            return Err("Capacity must be greater than 0".to_string());
        }

        Ok(())
    }
}
