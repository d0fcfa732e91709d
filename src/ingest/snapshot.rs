//! HTTP snapshot polling.
//!
//! Many course cameras only expose a still-image endpoint. Each poll fetches
//! one JPEG with a cache-busting `t=<millis>` query parameter so CDNs and
//! proxies cannot serve a stale image.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{decode_jpeg, FrameGrabber, MAX_JPEG_BYTES};
use crate::{unix_millis, Clock};

const CACHE_BUST_PARAM: &str = "t";

/// Polls a JPEG endpoint once per `grab`.
pub struct HttpSnapshotGrabber {
    url: Url,
    agent: ureq::Agent,
    clock: Arc<dyn Clock>,
    last_stamp: u128,
}

impl HttpSnapshotGrabber {
    pub fn new(url: Url, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            url,
            agent,
            clock,
            last_stamp: 0,
        }
    }

    /// Strictly increasing cache-bust value, even if the clock stalls.
    fn next_stamp(&mut self) -> u128 {
        let stamp = unix_millis(self.clock.now()).max(self.last_stamp + 1);
        self.last_stamp = stamp;
        stamp
    }

    fn fetch_bytes(&mut self) -> Result<Vec<u8>> {
        let stamp = self.next_stamp();
        let url = cache_busted_url(&self.url, stamp);
        let response = self
            .agent
            .get(url.as_str())
            .set("Accept", "image/jpeg,image/*;q=0.8")
            .set("Cache-Control", "no-cache")
            .set("Pragma", "no-cache")
            .call()
            .with_context(|| format!("fetch snapshot from {}", self.url))?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64 + 1)
            .read_to_end(&mut bytes)
            .context("read snapshot body")?;
        if bytes.len() > MAX_JPEG_BYTES {
            return Err(anyhow!("snapshot exceeds {} bytes", MAX_JPEG_BYTES));
        }
        if bytes.is_empty() {
            return Err(anyhow!("empty snapshot"));
        }
        Ok(bytes)
    }
}

impl FrameGrabber for HttpSnapshotGrabber {
    fn describe(&self) -> String {
        format!("snapshot {}", self.url)
    }

    fn grab(&mut self) -> Result<RgbImage> {
        let bytes = self.fetch_bytes()?;
        decode_jpeg(&bytes)
    }
}

/// `base` with its cache-bust parameter replaced by `stamp`.
///
/// Other query parameters are preserved in order.
pub fn cache_busted_url(base: &Url, stamp: u128) -> Url {
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != CACHE_BUST_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut url = base.clone();
    url.set_query(None);
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
        pairs.append_pair(CACHE_BUST_PARAM, &stamp.to_string());
    }
    url
}
