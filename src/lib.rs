use {
    crate::browser::{ChromeRenderer, Renderer},
    crate::config::Config,
    crate::context::AcquisitionContext,
    crate::error::{Error, Result},
    crate::orchestrator::Orchestrator,
    crate::progress::ProgressSink,
    crate::quality::QualityTier,
    log::info,
    regex::Regex,
    std::path::PathBuf,
    std::sync::{Arc, LazyLock},
    std::time::{Duration, SystemTime, UNIX_EPOCH},
    url::Url,
};

pub mod browser;
pub mod candidates;
pub mod config;
pub mod context;
pub mod download;
pub mod error;
pub mod observer;
pub mod orchestrator;
pub mod playlist;
pub mod progress;
pub mod quality;
pub mod transcode;

/// Process exit status for any failure other than an interrupt.
pub const EXIT_FAILURE: i32 = 1;
/// 128 + SIGINT, as shells report it.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Hosts whose posts can be downloaded.
pub const SUPPORTED_HOSTS: [&str; 2] = ["twitter.com", "x.com"];

static STATUS_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/status(?:es)?/(\d+)").expect("valid status pattern"));

/// Everything one download needs.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub url: String,
    /// Exact output file. When unset the file goes to `output_dir`.
    pub output: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub timeout: Duration,
    pub quality: QualityTier,
    pub fast: bool,
    pub ffmpeg_path: PathBuf,
    pub chrome_path: PathBuf,
    pub show_browser: bool,
    pub user_agent: String,
    pub scratch_dir: PathBuf,
}

impl DownloadOptions {
    /// Options for `url` taken from `config`.
    ///
    /// # Errors
    ///
    /// Fails when no browser is configured and none can be found.
    pub fn from_config(url: impl Into<String>, config: &Config) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            output: None,
            output_dir: config.output_dir.clone(),
            timeout: config.timeout(),
            quality: config.quality,
            fast: config.fast,
            ffmpeg_path: config.ffmpeg_path.clone(),
            chrome_path: config.browser_executable()?,
            show_browser: config.show_browser,
            user_agent: config.user_agent.clone(),
            scratch_dir: config.scratch_dir(),
        })
    }

    /// The file the video will be written to.
    pub fn destination(&self) -> PathBuf {
        match &self.output {
            Some(path) => path.clone(),
            None => self
                .output_dir
                .join(format!("{}.mp4", output_name(&self.url))),
        }
    }
}

/// Downloads the video of the post in `options` and returns where it was saved.
///
/// Resources are registered in `ctx`, so an interrupt handler holding the same
/// context can tear them down.
pub async fn download_post(
    options: &DownloadOptions,
    ctx: &AcquisitionContext,
    sink: Arc<dyn ProgressSink>,
) -> Result<PathBuf> {
    if !is_supported_url(&options.url) {
        return Err(Error::InvalidUrl(options.url.clone()));
    }
    let renderer = ChromeRenderer::new(
        &options.chrome_path,
        !options.show_browser,
        &options.scratch_dir,
    );
    download_post_with(options, ctx, sink, Arc::new(renderer)).await
}

/// [`download_post`] with the page rendering supplied by the caller.
pub async fn download_post_with(
    options: &DownloadOptions,
    ctx: &AcquisitionContext,
    sink: Arc<dyn ProgressSink>,
    renderer: Arc<dyn Renderer>,
) -> Result<PathBuf> {
    if !is_supported_url(&options.url) {
        return Err(Error::InvalidUrl(options.url.clone()));
    }
    let destination = options.destination();

    let client = reqwest::Client::builder()
        .user_agent(&options.user_agent)
        .build()?;

    let outcome = Orchestrator::new(renderer)
        .with_client(client)
        .with_progress(sink)
        .with_transcoder(&options.ffmpeg_path)
        .with_user_agent(&options.user_agent)
        .with_timeout(options.timeout)
        .with_quality(options.quality)
        .with_fast(options.fast)
        .acquire(ctx, &options.url, &destination)
        .await?;

    info!(
        "Saved {} from {} ({} strategy)",
        destination.display(),
        outcome.source,
        outcome.strategy
    );
    Ok(destination)
}

/// The process exit status for the result of [`download_post`].
pub fn exit_code(result: &Result<PathBuf>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) if e.is_cancelled() => EXIT_INTERRUPTED,
        Err(_) => EXIT_FAILURE,
    }
}

/// Whether `url` points at a twitter.com or x.com page.
pub fn is_supported_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    SUPPORTED_HOSTS.iter().any(|supported| {
        host == *supported
            || host
                .strip_suffix(supported)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// The numeric status id in a post URL.
pub fn post_id(url: &str) -> Option<String> {
    STATUS_ID
        .captures(url)
        .map(|caps| caps[1].to_string())
}

/// The post id, or `video_<unix seconds>` when the URL has none.
pub fn output_name(url: &str) -> String {
    post_id(url).unwrap_or_else(|| {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        format!("video_{}", seconds)
    })
}
