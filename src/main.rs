use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use thread_harvest::core::config::load_harvest_config;
use thread_harvest::features::sequence_watcher::{AppendEvent, AppendHandler};
use thread_harvest::scraping::browser_manager::{launch_browser, wait_for_render_tree};
use thread_harvest::scraping::{CdpPage, NetworkTap};
use thread_harvest::sync::network::NetworkBuffer;
use thread_harvest::{HarvestReport, Harvester};

const USAGE: &str = "usage: thread-harvest --url <URL> [--config <path>] [--headful]";

#[derive(Debug, Default)]
struct CliArgs {
    url: Option<String>,
    config: Option<PathBuf>,
    headful: bool,
}

fn parse_args() -> CliArgs {
    let mut out = CliArgs::default();
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        if a == "--url" {
            out.url = args.next();
        } else if let Some(rest) = a.strip_prefix("--url=") {
            out.url = Some(rest.to_string());
        } else if a == "--config" {
            out.config = args.next().map(PathBuf::from);
        } else if let Some(rest) = a.strip_prefix("--config=") {
            out.config = Some(PathBuf::from(rest));
        } else if a == "--headful" {
            out.headful = true;
        } else {
            warn!("ignoring unknown argument `{}`", a);
        }
    }
    out
}

/// Logs each appended element; the CLI has no downstream consumer.
fn logging_handler(name: String) -> Arc<dyn AppendHandler> {
    Arc::new(move |event: AppendEvent| {
        info!(
            "[{}] append #{} (watch {}): {}",
            name, event.index, event.signature, event.element
        );
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,chromiumoxide=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();
    let Some(url) = args.url else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = load_harvest_config(args.config.as_deref());
    let endpoint = config.resolve_endpoint_pattern();
    let buffer = NetworkBuffer::new(config.resolve_network_buffer_capacity());

    let mut harvester = Harvester::new(config.clone());
    for store in &config.stores {
        for seq in &store.sequences {
            harvester.register_handler(&seq.handler, logging_handler(seq.handler.clone()));
        }
    }

    let (mut browser, handler_task) = launch_browser(args.headful).await?;

    let result: anyhow::Result<HarvestReport> = async {
        let page = browser.new_page("about:blank").await?;
        let cdp = CdpPage::attach(page.clone()).await?;

        let tap = match endpoint.as_deref().map(Regex::new) {
            Some(Ok(pattern)) => Some(NetworkTap::attach(&page, pattern, buffer.clone()).await?),
            Some(Err(e)) => {
                warn!("invalid network endpoint pattern: {}; network channel disabled", e);
                None
            }
            None => None,
        };

        info!("navigating to {}", url);
        page.goto(url.as_str()).await?;
        wait_for_render_tree(&page, Duration::from_secs(15)).await;

        let init = harvester.initialize(&cdp, &cdp).await?;
        let outcome = harvester.paginate(&cdp, &buffer).await?;
        info!(
            "done: {} records, state {:?}, {} attempts",
            outcome.total(),
            outcome.state,
            outcome.attempts_used
        );

        if let Some(tap) = tap {
            tap.detach();
        }
        Ok(HarvestReport {
            url: url.clone(),
            init,
            outcome,
        })
    }
    .await;

    if let Err(e) = browser.close().await {
        warn!("Browser close error (non-fatal): {}", e);
    }
    handler_task.abort();

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
