//! Watching a rendered post to find out which media it loads.
//!
//! Responses are the main signal. When they are not enough the observer pokes
//! the page in a fixed order: click the player, read `<video>` sources, read
//! resource timings, nudge the page, and finally read Open Graph tags. Each
//! probe is best effort; a failing probe is logged and the next one runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::browser::{PageResponse, PageSession, ResponseHandler, WaitUntil};
use crate::candidates::{self, CandidateRegistry, Candidates};
use crate::error::{Error, Result};
use crate::quality::{self, QualityTier};

/// Elements that hold the post's player, most specific first.
pub const VIDEO_SELECTORS: [&str; 5] = [
    r#"[data-testid="videoPlayer"] video"#,
    r#"[data-testid="videoComponent"] video"#,
    r#"div[data-testid="tweetPhoto"] video"#,
    "article video",
    "video",
];

/// Regions clicked, in order, when nothing has loaded yet.
pub const NUDGE_TARGETS: [&str; 2] = ["main", r#"[data-testid="videoPlayer"]"#];

/// Meta tags that may carry a video URL, best first.
pub const META_PROPERTIES: [&str; 4] = [
    "og:video:secure_url",
    "og:video:url",
    "og:video",
    "twitter:player:stream",
];

const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Upper bound on the fast window's wait for the load event.
const FAST_NAVIGATION_LIMIT: Duration = Duration::from_secs(15);

const DOM_SCRIPT: &str = "Array.from(document.querySelectorAll('video')).flatMap(v => \
    [v.src, v.currentSrc, ...Array.from(v.querySelectorAll('source')).map(s => s.src)]\
    ).filter(Boolean)";

const RESOURCE_SCRIPT: &str =
    "performance.getEntriesByType('resource').map(entry => entry.name)";

/// Feeds every observed response into a registry.
pub struct RegistryRecorder {
    registry: Arc<CandidateRegistry>,
}

impl RegistryRecorder {
    pub fn new(registry: Arc<CandidateRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ResponseHandler for RegistryRecorder {
    async fn on_response(&self, response: &dyn PageResponse) {
        let url = response.url();
        let content_type = response.content_type();
        self.registry.record(url, content_type);

        let is_json = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
        if !is_json || !candidates::is_api_url(url) {
            return;
        }
        match response.json().await {
            Ok(body) => {
                for found in candidates::scan_json(&body) {
                    self.registry.record(&found, None);
                }
            }
            Err(e) => debug!("Could not read API response {}: {}", url, e),
        }
    }
}

/// How long and how hard to look.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationWindow {
    pub navigation_timeout: Duration,
    pub wait_until: WaitUntil,
    /// Longest wait for a first video candidate after navigation.
    pub settle: Duration,
    /// Extra wait after the first candidate, so sibling variants arrive too.
    pub linger: Duration,
    /// Per-selector wait; `None` skips the selector probe.
    pub selector_wait: Option<Duration>,
    /// Pause after each nudge click; `None` skips nudging.
    pub nudge_wait: Option<Duration>,
}

impl ObservationWindow {
    /// A short look that stops as soon as something playable shows up.
    pub fn fast(timeout: Duration) -> Self {
        Self {
            navigation_timeout: timeout.min(FAST_NAVIGATION_LIMIT),
            wait_until: WaitUntil::Load,
            settle: Duration::from_secs(6),
            linger: Duration::ZERO,
            selector_wait: None,
            nudge_wait: None,
        }
    }

    /// A thorough look, scaled to the caller's timeout budget.
    pub fn full(timeout: Duration) -> Self {
        Self {
            navigation_timeout: timeout,
            wait_until: WaitUntil::NetworkIdle,
            settle: (timeout / 3).max(Duration::from_secs(5)),
            linger: Duration::from_millis(1500),
            selector_wait: Some((timeout / 12).max(Duration::from_secs(3))),
            nudge_wait: Some(Duration::from_secs(2)),
        }
    }
}

/// What an observation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    pub candidates: Candidates,
    /// A URL from the page's meta tags that could not be classified.
    pub meta_fallback: Option<String>,
}

impl Discovery {
    /// Picks the URLs to fetch for `tier`, falling back to the meta tag.
    pub fn select(&self, tier: QualityTier) -> quality::Selection {
        let mut selection = quality::select(&self.candidates, tier);
        if selection.video.is_none() {
            selection.video = self.meta_fallback.clone();
        }
        selection
    }
}

/// Drives one page and collects what it loads.
pub struct PageObserver {
    session: Arc<dyn PageSession>,
    registry: Arc<CandidateRegistry>,
    cancel: CancellationToken,
}

impl PageObserver {
    /// Prepares `session` for observation and subscribes to its responses.
    pub async fn attach(
        session: Arc<dyn PageSession>,
        user_agent: &str,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let registry = Arc::new(CandidateRegistry::new());

        session.set_user_agent(user_agent).await?;
        let headers = HashMap::from([(
            "Accept-Language".to_string(),
            "en-US,en;q=0.9".to_string(),
        )]);
        session.set_extra_headers(&headers).await?;
        session.set_request_interception(true).await?;
        session.add_response_handler(Arc::new(RegistryRecorder::new(Arc::clone(&registry))));

        Ok(Self {
            session,
            registry,
            cancel,
        })
    }

    /// Loads `url` and runs the probes that `window` allows.
    ///
    /// Only cancellation is an error; everything else degrades to fewer
    /// candidates.
    pub async fn observe(&self, url: &str, window: &ObservationWindow) -> Result<Discovery> {
        info!("Loading {}", url);
        let navigation = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.session.goto(url, window.navigation_timeout, window.wait_until) => result,
        };
        if let Err(e) = navigation {
            warn!("Navigation did not complete cleanly: {}", e);
        }

        if let Some(wait) = window.selector_wait {
            self.best_effort("selector", self.activate_player(wait))
                .await?;
        }

        self.settle(window).await?;

        if !self.found_video() {
            self.best_effort("video element", self.scrape_dom()).await?;
            self.best_effort("resource timing", self.scrape_resources())
                .await?;
        }

        if let Some(wait) = window.nudge_wait {
            if !self.found_video() {
                info!("Nothing found yet, nudging the page");
                self.best_effort("nudge", self.nudge(wait)).await?;
                self.best_effort("video element", self.scrape_dom()).await?;
                self.best_effort("resource timing", self.scrape_resources())
                    .await?;
            }
        }

        let candidates = self.registry.snapshot();
        let mut meta_fallback = None;
        if !candidates.has_video() {
            match self.read_meta().await {
                Ok(Some(meta)) => {
                    if self.registry.record(&meta, None).is_empty() {
                        meta_fallback = Some(meta);
                    }
                }
                Ok(None) => debug!("No video meta tag on the page"),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!("Meta tag probe failed: {}", e),
            }
        }

        let discovery = Discovery {
            candidates: self.registry.snapshot(),
            meta_fallback,
        };
        debug!(
            "Observation finished with {} candidates",
            discovery.candidates.len()
        );
        Ok(discovery)
    }

    fn found_video(&self) -> bool {
        self.registry.has_video()
    }

    /// Runs a probe, logging its failure instead of returning it.
    async fn best_effort<F>(&self, name: &str, probe: F) -> Result<()>
    where
        F: Future<Output = Result<usize>>,
    {
        match probe.await {
            Ok(found) => debug!("{} probe added {} URLs", name, found),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!("{} probe failed: {}", name, e),
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn pause(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Waits for a playable candidate, then lingers for its siblings.
    async fn settle(&self, window: &ObservationWindow) -> Result<()> {
        let deadline = Instant::now() + window.settle;
        while !self.found_video() {
            if Instant::now() >= deadline {
                debug!("No candidate within {:?}", window.settle);
                return Ok(());
            }
            self.pause(POLL_INTERVAL).await?;
        }
        if !window.linger.is_zero() {
            self.pause(window.linger).await?;
        }
        Ok(())
    }

    /// Finds the player and clicks it so the page starts fetching media.
    async fn activate_player(&self, wait: Duration) -> Result<usize> {
        let before = self.registry.snapshot().len();
        for selector in VIDEO_SELECTORS {
            let present = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                present = self.session.wait_for_selector(selector, wait) => present?,
            };
            if present {
                debug!("Player matched {}", selector);
                self.click(selector).await?;
                break;
            }
        }
        Ok(self.registry.snapshot().len().saturating_sub(before))
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; \
             el.scrollIntoView({{ block: 'center' }}); \
             if (el.play) {{ el.muted = true; const p = el.play(); if (p && p.catch) p.catch(() => {{}}); }} \
             el.click(); return true; }})()",
            serde_json::to_string(selector)?
        );
        Ok(self.session.evaluate(&script).await? == Value::Bool(true))
    }

    fn record_all(&self, value: Value) -> usize {
        let Value::Array(urls) = value else {
            return 0;
        };
        urls.iter()
            .filter_map(Value::as_str)
            .filter(|url| !self.registry.record(url, None).is_empty())
            .count()
    }

    async fn scrape_dom(&self) -> Result<usize> {
        let sources = self.session.evaluate(DOM_SCRIPT).await?;
        Ok(self.record_all(sources))
    }

    async fn scrape_resources(&self) -> Result<usize> {
        let entries = self.session.evaluate(RESOURCE_SCRIPT).await?;
        let media = match entries {
            Value::Array(entries) => entries
                .into_iter()
                .filter(|entry| entry.as_str().is_some_and(candidates::looks_like_media))
                .collect(),
            _ => Vec::new(),
        };
        Ok(self.record_all(Value::Array(media)))
    }

    async fn nudge(&self, wait: Duration) -> Result<usize> {
        let before = self.registry.snapshot().len();
        for target in NUDGE_TARGETS {
            if let Err(e) = self.click(target).await {
                debug!("Could not click {}: {}", target, e);
            }
            self.pause(wait).await?;
        }
        Ok(self.registry.snapshot().len().saturating_sub(before))
    }

    async fn read_meta(&self) -> Result<Option<String>> {
        let script = format!(
            "(() => {{ for (const p of {}) {{ \
             const el = document.querySelector(`meta[property=\"${{p}}\"], meta[name=\"${{p}}\"]`); \
             if (el && el.content) return el.content; }} return null; }})()",
            serde_json::to_string(&META_PROPERTIES)?
        );
        let value = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            value = self.session.evaluate(&script) => value?,
        };
        Ok(value
            .as_str()
            .map(str::trim)
            .filter(|url| url.starts_with("http"))
            .map(str::to_string))
    }
}
