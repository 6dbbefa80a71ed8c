//! # Tracker Communication
//!
//! Peers are discovered by an HTTP GET to the torrent's announce URL:
//!
//! ```text
//! <announce>?info_hash=<hash>&peer_id=<id>&port=6881&uploaded=0&downloaded=0&left=<n>&compact=1
//! ```
//!
//! `info_hash` and `peer_id` are raw 20-byte values, percent-encoded with
//! unreserved characters passed through. The tracker answers with a
//! bencoded dictionary:
//!
//! - **interval**: seconds to wait before the next announce
//! - **min interval**: optional lower bound for re-announces
//! - **complete** / **incomplete**: seeders and leechers in the swarm
//! - **peers**: compact peer list (see [`crate::peer`])
//!
//! A `failure reason` key replaces all of the above when the tracker rejects
//! the request.

use std::time::Duration;

use anyhow::{anyhow, Context};
use url::Url;

use crate::bencode::{self, Value};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::peer::{parse_compact_peers, Peer};
use crate::torrent::Metadata;

/// Decoded tracker announce response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    pub interval: i64,
    pub min_interval: Option<i64>,
    pub complete: Option<i64>,
    pub incomplete: Option<i64>,
    pub peers: Vec<Peer>,
}

/// Parse a raw tracker response body.
pub fn parse_tracker_response(body: &[u8]) -> Result<TrackerResponse> {
    let value = bencode::decode_exact(body)?;
    if value.as_dict().is_none() {
        return Err(Error::Tracker("response is not a dictionary".into()));
    }

    if let Some(reason) = value.get("failure reason") {
        let reason = reason
            .as_bytes()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .unwrap_or_else(|| "unspecified".into());
        return Err(Error::Tracker(reason));
    }

    let interval = value
        .get("interval")
        .and_then(Value::as_integer)
        .ok_or_else(|| Error::Tracker("response has no interval".into()))?;
    let peers = value
        .get("peers")
        .and_then(Value::as_bytes)
        .ok_or_else(|| Error::Tracker("response has no compact peer list".into()))?;

    Ok(TrackerResponse {
        interval,
        min_interval: value.get("min interval").and_then(Value::as_integer),
        complete: value.get("complete").and_then(Value::as_integer),
        incomplete: value.get("incomplete").and_then(Value::as_integer),
        peers: parse_compact_peers(peers)?,
    })
}

/// Peers listed in a raw tracker response body.
pub fn fetch_peer_list(body: &[u8]) -> Result<Vec<Peer>> {
    let response = parse_tracker_response(body)?;
    debug!(
        "Tracker returned {} peers (interval {}s)",
        response.peers.len(),
        response.interval
    );
    Ok(response.peers)
}

/// Build the announce URL for `metadata`.
///
/// # Arguments
///
/// * `metadata` - The torrent being downloaded.
/// * `peer_id` - 20-byte identifier of this client.
/// * `port` - Port number reported to the tracker.
///
pub fn announce_url(metadata: &Metadata, peer_id: &[u8; 20], port: u16) -> anyhow::Result<String> {
    // Validate the tracker URL before appending binary query values to it
    let base_url = Url::parse(&metadata.announce)
        .map_err(|e| anyhow!("could not parse tracker url '{}': {}", metadata.announce, e))?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        urlencoding::encode_binary(&metadata.info_hash),
        urlencoding::encode_binary(peer_id),
        port,
        metadata.length
    );

    let mut url = base_url.to_string();
    if base_url.query().is_some() {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    Ok(url)
}

/// Announce to the tracker and return its response.
pub fn announce(metadata: &Metadata, config: &Config) -> anyhow::Result<TrackerResponse> {
    let url = announce_url(metadata, &config.peer_id, config.port)?;
    info!("Announcing to tracker {}", metadata.announce);

    let client = reqwest::blocking::Client::builder()
        .timeout(config.tracker_timeout)
        .build()
        .context("could not build HTTP client")?;

    let body = client
        .get(&url)
        .send()
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.bytes())
        .with_context(|| format!("could not reach tracker {}", metadata.announce))?;

    let response = parse_tracker_response(&body)?;
    info!("Tracker returned {}", summary(&response));

    Ok(response)
}

fn summary(response: &TrackerResponse) -> String {
    format!(
        "{} peers ({} seeders, {} leechers), next announce in {}s",
        response.peers.len(),
        response.complete.unwrap_or(0),
        response.incomplete.unwrap_or(0),
        reannounce_after(response).as_secs()
    )
}

/// Seconds before the tracker expects the next announce.
pub fn reannounce_after(response: &TrackerResponse) -> Duration {
    let secs = response.min_interval.unwrap_or(response.interval).max(0);
    Duration::from_secs(secs as u64)
}
