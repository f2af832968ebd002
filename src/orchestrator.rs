//! Fast and full acquisition strategies, and dispatch to a downloader or the transcoder.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::browser::Renderer;
use crate::candidates::{self, Candidates};
use crate::config::DEFAULT_USER_AGENT;
use crate::context::AcquisitionContext;
use crate::download::Downloader;
use crate::error::{Error, Result};
use crate::observer::{Discovery, ObservationWindow, PageObserver};
use crate::playlist::{self, ResolvedPlaylist};
use crate::progress::{ProgressSink, SilentProgress};
use crate::quality::{QualityTier, Selection};
use crate::transcode::{self, TranscodeSupervisor};

/// Which strategy produced the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Short observation, browser closed before the download.
    Fast,
    /// Long observation with page interaction, browser kept open.
    Full,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Fast => f.write_str("fast"),
            Strategy::Full => f.write_str("full"),
        }
    }
}

/// How the file was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A complete file fetched byte for byte.
    Downloaded { bytes: u64 },
    /// A stream remuxed or muxed by the transcoder.
    Transcoded,
}

/// A finished acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub strategy: Strategy,
    /// The video URL that was fetched.
    pub source: String,
    pub delivery: Delivery,
}

/// Runs the strategies in order and writes the result to disk.
#[derive(Clone)]
pub struct Orchestrator {
    renderer: Arc<dyn Renderer>,
    client: reqwest::Client,
    sink: Arc<dyn ProgressSink>,
    transcoder: PathBuf,
    user_agent: String,
    timeout: Duration,
    quality: QualityTier,
    fast: bool,
}

impl Orchestrator {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            client: reqwest::Client::new(),
            sink: Arc::new(SilentProgress),
            transcoder: PathBuf::from("ffmpeg"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(60),
            quality: QualityTier::default(),
            fast: true,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The transcoder executable, `ffmpeg` by default.
    pub fn with_transcoder(mut self, program: impl Into<PathBuf>) -> Self {
        self.transcoder = program.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Navigation timeout. The full strategy scales its waits from it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_quality(mut self, quality: QualityTier) -> Self {
        self.quality = quality;
        self
    }

    /// Whether to try the fast strategy before the full one.
    pub fn with_fast(mut self, fast: bool) -> Self {
        self.fast = fast;
        self
    }

    /// Finds the video of `post_url` and writes it to `destination`.
    ///
    /// The fast strategy runs first unless disabled; any failure of it other
    /// than cancellation hands over to the full strategy, whose failure is final.
    pub async fn acquire(
        &self,
        ctx: &AcquisitionContext,
        post_url: &str,
        destination: &Path,
    ) -> Result<Outcome> {
        if self.fast {
            match self.run_fast(ctx, post_url, destination).await {
                Ok(outcome) => return Ok(outcome),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!("Fast strategy failed: {}. Retrying with a full session", e),
            }
        }
        self.run_full(ctx, post_url, destination).await
    }

    async fn run_fast(
        &self,
        ctx: &AcquisitionContext,
        post_url: &str,
        destination: &Path,
    ) -> Result<Outcome> {
        info!("Trying the fast strategy");
        let window = ObservationWindow::fast(self.timeout);
        let discovery = self.discover(ctx, post_url, &window).await;
        // Nothing below needs the browser.
        ctx.close_session().await;

        let discovery = discovery?;
        let selection = self.choose(post_url, &discovery)?;
        self.dispatch(ctx, Strategy::Fast, &discovery.candidates, &selection, destination)
            .await
    }

    async fn run_full(
        &self,
        ctx: &AcquisitionContext,
        post_url: &str,
        destination: &Path,
    ) -> Result<Outcome> {
        info!("Running the full strategy");
        let window = ObservationWindow::full(self.timeout);
        let result = async {
            let discovery = self.discover(ctx, post_url, &window).await?;
            let selection = self.choose(post_url, &discovery)?;
            self.dispatch(ctx, Strategy::Full, &discovery.candidates, &selection, destination)
                .await
        }
        .await;
        ctx.close_session().await;
        result
    }

    /// Opens a session and observes the post. The session stays in `ctx`.
    async fn discover(
        &self,
        ctx: &AcquisitionContext,
        post_url: &str,
        window: &ObservationWindow,
    ) -> Result<Discovery> {
        let session = ctx.open_session(self.renderer.as_ref()).await?;
        let observer = PageObserver::attach(session, &self.user_agent, ctx.cancellation()).await?;
        observer.observe(post_url, window).await
    }

    fn choose(&self, post_url: &str, discovery: &Discovery) -> Result<Selection> {
        let selection = discovery.select(self.quality);
        match &selection.video {
            Some(video) => {
                info!("Selected {}", video);
                if let Some(audio) = &selection.audio {
                    info!("Paired audio {}", audio);
                }
                Ok(selection)
            }
            None => Err(Error::DiscoveryEmpty(post_url.to_string())),
        }
    }

    async fn dispatch(
        &self,
        ctx: &AcquisitionContext,
        strategy: Strategy,
        candidates: &Candidates,
        selection: &Selection,
        destination: &Path,
    ) -> Result<Outcome> {
        ctx.check()?;
        let video = selection
            .video
            .clone()
            .ok_or_else(|| Error::DiscoveryEmpty(destination.display().to_string()))?;

        let streamed = candidates::is_manifest(&video)
            || candidates.manifests.contains(&video)
            || candidates.video_streams.contains(&video);
        if !streamed {
            let bytes = Downloader::new(self.client.clone())
                .with_progress(Arc::clone(&self.sink))
                .with_cancellation(ctx.cancellation())
                .download(&video, destination)
                .await?;
            return Ok(Outcome {
                strategy,
                source: video,
                delivery: Delivery::Downloaded { bytes },
            });
        }

        let (input, audio) = match &selection.audio {
            Some(audio) => (video.clone(), Some(audio.clone())),
            None => self.expand_manifest(ctx, &video).await?,
        };
        let args = match &audio {
            Some(audio) => transcode::mux_args(&input, audio, destination),
            None => transcode::remux_args(&input, destination),
        };
        TranscodeSupervisor::new(&self.transcoder)
            .with_progress(Arc::clone(&self.sink))
            .with_cancellation(ctx.cancellation())
            .with_slot(ctx.subprocess_slot())
            .run(&args, destination)
            .await?;

        Ok(Outcome {
            strategy,
            source: video,
            delivery: Delivery::Transcoded,
        })
    }

    /// Picks a variant and its audio out of a master playlist.
    ///
    /// Media playlists, and playlists that cannot be fetched, are passed on unchanged.
    async fn expand_manifest(
        &self,
        ctx: &AcquisitionContext,
        url: &str,
    ) -> Result<(String, Option<String>)> {
        let cancel = ctx.cancellation();
        let resolved = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            resolved = playlist::fetch(&self.client, url) => resolved,
        };

        match resolved {
            Ok(resolved @ ResolvedPlaylist::Master(_)) => match resolved.variant(self.quality) {
                Some(variant) => {
                    info!(
                        "Using {} variant at {} bit/s{}",
                        self.quality,
                        variant.bandwidth,
                        variant
                            .resolution
                            .map(|(w, h)| format!(" ({}x{})", w, h))
                            .unwrap_or_default()
                    );
                    Ok((variant.uri.clone(), variant.audio.clone()))
                }
                None => {
                    warn!("Master playlist {} lists no variants", url);
                    Ok((url.to_string(), None))
                }
            },
            Ok(ResolvedPlaylist::Media(segments)) => {
                debug!("Media playlist with {} segments", segments.len());
                for segment in segments.iter().take(3) {
                    debug!("  {}", segment);
                }
                Ok((url.to_string(), None))
            }
            Err(e) => {
                warn!("Could not inspect playlist {}: {}", url, e);
                Ok((url.to_string(), None))
            }
        }
    }
}
