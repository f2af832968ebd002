use clap::{CommandFactory, Parser};
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tweetvid::config::Config;
use tweetvid::context::AcquisitionContext;
use tweetvid::progress::ConsoleProgress;
use tweetvid::quality::QualityTier;
use tweetvid::{
    download_post, exit_code, is_supported_url, DownloadOptions, EXIT_FAILURE, EXIT_INTERRUPTED,
};

#[derive(Parser, Clone)]
#[command(name = "tweetvid", version, about = "Download the video of a Twitter/X post")]
pub struct Cli {
    /// The post URL, e.g. https://x.com/user/status/1234567890
    pub url: Option<String>,

    /// Exact file to write. Defaults to <output-dir>/<post id>.mp4
    #[arg(long = "output", short)]
    pub output: Option<PathBuf>,

    #[arg(long = "output-dir", short = 'd')]
    pub output_dir: Option<PathBuf>,

    /// Navigation timeout in seconds
    #[arg(long = "timeout", short)]
    pub timeout: Option<u64>,

    #[arg(
        long = "quality",
        short,
        value_parser = clap::builder::PossibleValuesParser::new(QualityTier::NAMES)
    )]
    pub quality: Option<String>,

    /// Skip the fast strategy and go straight to a full browser session
    #[arg(long = "no-fast", action = clap::ArgAction::SetTrue)]
    pub no_fast: bool,

    #[arg(
        long = "verbosity",
        short,
        default_value = "info",
        value_parser = clap::builder::PossibleValuesParser::new([
            "info", "debug", "error", "none", "full"
        ])
    )]
    pub verbosity: String,
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let multi = MultiProgress::new();
    init_logging(&args.verbosity, multi.clone());

    let Some(url) = args.url.clone() else {
        let _ = Cli::command().print_help();
        println!();
        return;
    };
    if !is_supported_url(&url) {
        error!("{} is not a twitter.com or x.com URL", url);
        std::process::exit(EXIT_FAILURE);
    }

    let options = match build_options(url, &args, &Config::load()) {
        Ok(options) => options,
        Err(e) => {
            error!("{}", e);
            std::process::exit(EXIT_FAILURE);
        }
    };

    let ctx = Arc::new(AcquisitionContext::new());
    let signal_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cleaning up");
            signal_ctx.shutdown().await;
            std::process::exit(EXIT_INTERRUPTED);
        }
    });

    let sink = Arc::new(ConsoleProgress::new(multi));
    let result = download_post(&options, &ctx, sink).await;
    match &result {
        Ok(path) => info!("Done: {}", path.display()),
        Err(e) if e.is_cancelled() => ctx.shutdown().await,
        Err(e) => error!("{}", e),
    }
    std::process::exit(exit_code(&result));
}

fn build_options(
    url: String,
    args: &Cli,
    config: &Config,
) -> tweetvid::error::Result<DownloadOptions> {
    let mut options = DownloadOptions::from_config(url, config)?;
    options.output = args.output.clone();
    if let Some(dir) = &args.output_dir {
        options.output_dir = dir.clone();
    }
    if let Some(seconds) = args.timeout {
        options.timeout = Duration::from_secs(seconds.max(1));
    }
    if let Some(Ok(quality)) = args.quality.as_deref().map(str::parse::<QualityTier>) {
        options.quality = quality;
    }
    if args.no_fast {
        options.fast = false;
    }
    Ok(options)
}

fn init_logging(verbosity: &str, multi: MultiProgress) {
    let level = match verbosity {
        "debug" => LevelFilter::Debug,
        "error" => LevelFilter::Error,
        "none" => LevelFilter::Off,
        "full" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let mut builder = env_logger::Builder::new();
    if verbosity == "full" {
        builder.filter_level(level);
    } else {
        builder
            .filter_level(LevelFilter::Warn.min(level))
            .filter_module("tweetvid", level);
    }
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let logger = builder.format_timestamp(None).build();
    let max_level = logger.filter();

    if LogWrapper::new(multi, logger).try_init().is_ok() {
        log::set_max_level(max_level);
    }
}
