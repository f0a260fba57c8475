// =============================================================================
// LP Adapters — transport shims feeding the aggregator's quote channel
// =============================================================================
//
// Two transports are supported: a WebSocket stream of JSON quote frames and a
// REST endpoint polled on a fixed cadence returning a JSON array of quotes.
// Venue dialects (FIX etc.) live outside this process; everything here speaks
// the canonical inbound record `{symbol, bid, ask, timestamp, lp}`.
//
// Each adapter runs as its own task and reconnects with a flat backoff when
// the transport drops. The aggregator applies validity and staleness rules;
// adapters only parse and forward.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::runtime_config::{LpEndpoint, LpTransport};
use crate::types::Quote;

/// Delay before reconnecting a dropped LP transport.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Parse one inbound quote frame. The `lp` field defaults to `fallback_lp`
/// when the venue omits it.
pub fn parse_quote_frame(text: &str, fallback_lp: &str) -> Result<Quote> {
    let mut quote: Quote = serde_json::from_str(text).context("failed to parse quote frame")?;
    if quote.lp.is_empty() {
        quote.lp = fallback_lp.to_string();
    }
    Ok(quote)
}

/// Run one LP adapter until shutdown, reconnecting on transport errors.
pub async fn run_lp_adapter(
    endpoint: LpEndpoint,
    tx: mpsc::Sender<Quote>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(lp = %endpoint.id, url = %endpoint.url, transport = ?endpoint.transport, "LP adapter started");

    loop {
        let result = match endpoint.transport {
            LpTransport::Websocket => run_websocket(&endpoint, &tx, &mut shutdown).await,
            LpTransport::Rest => run_rest_poll(&endpoint, &tx, &mut shutdown).await,
        };

        match result {
            Ok(()) => {
                // Clean exit only happens on shutdown or channel close.
                info!(lp = %endpoint.id, "LP adapter stopped");
                return;
            }
            Err(e) => {
                error!(lp = %endpoint.id, error = %e, "LP stream error — reconnecting in {RECONNECT_DELAY_SECS}s");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

async fn run_websocket(
    endpoint: &LpEndpoint,
    tx: &mpsc::Sender<Quote>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (ws_stream, _response) = connect_async(&endpoint.url)
        .await
        .context("failed to connect to LP WebSocket")?;

    info!(lp = %endpoint.id, "LP WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        match parse_quote_frame(&text, &endpoint.id) {
                            Ok(quote) => {
                                if tx.send(quote).await.is_err() {
                                    return Ok(()); // aggregator gone
                                }
                            }
                            Err(e) => {
                                warn!(lp = %endpoint.id, error = %e, "unparseable quote frame");
                            }
                        }
                    }
                    Some(Ok(_)) => {} // ping/pong/binary: ignored
                    Some(Err(e)) => return Err(e.into()),
                    None => anyhow::bail!("LP WebSocket stream ended"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return Ok(()); }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// REST polling transport
// ---------------------------------------------------------------------------

async fn run_rest_poll(
    endpoint: &LpEndpoint,
    tx: &mpsc::Sender<Quote>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let mut ticker =
        tokio::time::interval(tokio::time::Duration::from_millis(endpoint.poll_ms.max(100)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let quotes: Vec<Quote> = client
                    .get(&endpoint.url)
                    .send()
                    .await
                    .context("LP poll request failed")?
                    .error_for_status()
                    .context("LP poll returned error status")?
                    .json()
                    .await
                    .context("LP poll returned invalid JSON")?;

                for mut quote in quotes {
                    if quote.lp.is_empty() {
                        quote.lp = endpoint.id.clone();
                    }
                    if tx.send(quote).await.is_err() {
                        return Ok(());
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return Ok(()); }
            }
        }
    }
}
