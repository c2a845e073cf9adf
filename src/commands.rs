//! CLI subcommands and their handlers.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::cache::{ActivationReport, CacheSource, CacheStorage};
use crate::net::HttpNetwork;
use crate::relay::{Relay, SubmitOutcome};
use crate::request::{Destination, FetchRequest};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Fetch every critical asset into a fresh generation for the configured version
  Install,
  /// Promote the installed generation and delete stale namespaces
  Activate,
  /// Install then activate
  Deploy,
  /// Route one request through the relay
  Fetch {
    /// Path or absolute URL
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Declared resource type (style, script, font, image, document, empty)
    #[arg(short, long, default_value = "empty")]
    destination: Destination,
    /// Extra request header as `Name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// Submit a mutating payload, queueing it if the network is unreachable
  Submit { file: PathBuf },
  /// Queue a payload for the next drain without attempting delivery
  Enqueue { file: PathBuf },
  /// Fire the sync trigger once
  Drain {
    /// Trigger topic (defaults to the configured retry topic)
    #[arg(short, long)]
    topic: Option<String>,
  },
  /// List pending operations
  Queue,
  /// List stored cache namespaces
  Namespaces,
  /// Watch connectivity and drain the retry queue until interrupted
  Watch,
}

pub async fn run<S: CacheStorage>(relay: &Relay<S>, command: Command, interval: Duration) -> Result<()> {
  match command {
    Command::Install => {
      let installed = relay.install().await?;
      println!("installed {}", installed.namespace());
    }
    Command::Activate => print_activation(&relay.activate()?),
    Command::Deploy => print_activation(&relay.deploy().await?),
    Command::Fetch {
      url,
      method,
      destination,
      headers,
    } => {
      let mut request = FetchRequest::get(relay.resolve(&url)?).with_destination(destination);
      request.method = method.to_ascii_uppercase();
      for header in &headers {
        let (name, value) = parse_header(header)?;
        request = request.with_header(name, value);
      }

      let result = relay.intercept(request).await?;
      if result.source == CacheSource::Offline {
        eprintln!("network unreachable, serving stored copy");
      }
      println!(
        "{} {} via {} ({} bytes, {})",
        result.entry.status,
        result.class,
        result.source,
        result.entry.body.len(),
        result.entry.header("content-type").unwrap_or("no content-type")
      );
    }
    Command::Submit { file } => match relay.submit(read_payload(&file)?).await? {
      SubmitOutcome::Delivered => println!("delivered"),
      SubmitOutcome::Queued(id) => println!("queued {}", id),
    },
    Command::Enqueue { file } => {
      let id = relay.enqueue(read_payload(&file)?)?;
      println!("queued {}", id);
    }
    Command::Drain { topic } => {
      let scheduler = relay.scheduler();
      let topic = topic.unwrap_or_else(|| scheduler.topic().to_string());
      match scheduler.trigger(&topic).await? {
        Some(report) => println!(
          "attempted {} succeeded {} failed {} corrupt removed {}",
          report.attempted, report.succeeded, report.failed, report.corrupt_removed
        ),
        None => println!("topic '{}' ignored", topic),
      }
    }
    Command::Queue => {
      for op in relay.pending()? {
        println!(
          "{}  {}  attempts={}  bytes={}  {}",
          op.id,
          op.created_at.format("%Y-%m-%d %H:%M:%S"),
          op.attempt_count,
          op.payload.len(),
          op.last_error.as_deref().unwrap_or("")
        );
      }
    }
    Command::Namespaces => {
      let listing = relay.namespaces()?;
      for name in &listing.all {
        let marker = if Some(name) == listing.active_assets.as_ref() {
          "  (active assets)"
        } else if Some(name) == listing.active_api.as_ref() {
          "  (active api)"
        } else {
          ""
        };
        println!("{}{}", name, marker);
      }
    }
    Command::Watch => {
      let probe_client = HttpNetwork::new(interval.min(Duration::from_secs(5)))?;
      let origin = relay.origin().clone();
      let probe = || {
        let client = probe_client.clone();
        let origin = origin.clone();
        async move { client.probe(&origin).await }
      };
      let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
          warn!(error = %e, "Could not listen for ctrl-c, stopping watch");
        }
      };

      relay.scheduler().run(interval, probe, shutdown).await;
    }
  }

  Ok(())
}

fn print_activation(report: &ActivationReport) {
  for name in &report.deleted {
    println!("deleted {}", name);
  }
  for (name, error) in &report.failed {
    println!("could not delete {}: {}", name, error);
  }
  println!("activated");
}

fn read_payload(path: &Path) -> Result<Vec<u8>> {
  std::fs::read(path).map_err(|e| eyre!("Failed to read payload {}: {}", path.display(), e))
}

/// Split `Name: value`.
fn parse_header(raw: &str) -> Result<(String, String)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Header must look like 'Name: value', got '{}'", raw))?;
  let name = name.trim();
  if name.is_empty() {
    return Err(eyre!("Header name is empty in '{}'", raw));
  }
  Ok((name.to_string(), value.trim().to_string()))
}
