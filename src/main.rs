//! Main entry point for the rangefetch CLI application.
//!
//! Streams a byte range of a remote object to stdout through the
//! read-ahead cache.

use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use rangefetch::metrics::{Counters, Statistic};
use rangefetch::{Cli, ReadAheadContext, RestClient};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let url = Url::parse(&cli.url).with_context(|| format!("invalid URL: {}", cli.url))?;
    let counters = Arc::new(Counters::new());
    let client = RestClient::new(&cli.client_config(url)?)?.with_metrics(counters.clone());
    let client = Arc::new(client);

    let context = ReadAheadContext::start(cli.read_ahead_config())?;
    let mut stream = context
        .open_rest_stream(client, "")
        .await
        .with_context(|| format!("failed to open {}", cli.url))?;

    let start = cli.offset.min(stream.len());
    let end = match cli.length {
        Some(length) => start.saturating_add(length).min(stream.len()),
        None => stream.len(),
    };
    stream.seek(start)?;

    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; cli.buffer_size.max(1)];
    let mut remaining = end - start;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = stream
            .read(&mut buf[..want])
            .await
            .with_context(|| format!("read failed at offset {}", stream.position()))?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    stdout.flush().await?;

    let statistics = stream.statistics();
    stream.close();
    context.shutdown().await;

    if !cli.is_quiet() {
        eprintln!(
            "\nRead {} ({} from read-ahead, {} direct reads)",
            format_size(statistics.total_bytes_read()),
            format_size(statistics.total_bytes_read_from_buffer()),
            statistics.remote_read_operations()
        );
        eprintln!("{}", transfer_summary(&counters));
    }

    Ok(())
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// One line of network totals. Every answered request counts, with or
/// without a body.
fn transfer_summary(counters: &Counters) -> String {
    format!(
        "Total bytes transferred: {} in {} requests ({} retried)",
        format_size(counters.get(Statistic::BytesReceived)),
        counters.get(Statistic::GetResponses),
        counters.get(Statistic::RetriedRequests)
    )
}

/// Format a byte size into a human-readable string.
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
