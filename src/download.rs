//! Chunked HTTP transfers straight to disk.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::header::CONTENT_LENGTH;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::progress::{ProgressSink, SilentProgress, TransferProgress};

/// Downloads one URL into one file, reporting progress as it goes.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            sink: Arc::new(SilentProgress),
            cancel: CancellationToken::new(),
        }
    }

    /// Sends progress to `sink` instead of discarding it.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Aborts the transfer once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Streams `url` into `destination` and returns the number of bytes written.
    ///
    /// The total size is learned from a `HEAD` request first. If that fails the
    /// transfer still runs, with progress shown as bytes only.
    ///
    /// # Errors
    ///
    /// [`Error::Transfer`] for a non-success status, [`Error::EmptyBody`] when
    /// nothing came back, [`Error::Cancelled`] if interrupted. A cancelled
    /// transfer leaves the partial file behind.
    pub async fn download(&self, url: &str, destination: &Path) -> Result<u64> {
        let result = self.transfer(url, destination).await;
        match &result {
            Ok(bytes) => {
                debug!("Wrote {} bytes to {}", bytes, destination.display());
                self.sink.finish(&format!("Saved {}", destination.display()));
            }
            Err(Error::Cancelled) => self.sink.abandon("Download interrupted"),
            Err(e) => self.sink.abandon(&format!("Download failed: {}", e)),
        }
        result
    }

    async fn transfer(&self, url: &str, destination: &Path) -> Result<u64> {
        let total = self.probe_size(url).await;

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            response = self.client.get(url).send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transfer {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if status == StatusCode::NO_CONTENT || header_length(response.headers()) == Some(0) {
            return Err(Error::EmptyBody(url.to_string()));
        }

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::File::create(destination).await?;

        let mut progress = TransferProgress::new(total, Instant::now());
        self.sink.transfer(&progress);

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => {
                    file.flush().await?;
                    return Err(Error::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            file.write_all(&chunk).await?;
            if progress.advance(chunk.len() as u64, Instant::now()) {
                self.sink.transfer(&progress);
            }
        }
        file.flush().await?;

        if progress.downloaded() == 0 {
            return Err(Error::EmptyBody(url.to_string()));
        }
        self.sink.transfer(&progress);
        Ok(progress.downloaded())
    }

    /// Size announced by a `HEAD` request, or `None` if it could not be learned.
    async fn probe_size(&self, url: &str) -> Option<u64> {
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            response = self.client.head(url).send() => response,
        };
        match response {
            Ok(response) if response.status().is_success() => {
                header_length(response.headers())
            }
            Ok(response) => {
                warn!(
                    "Size probe for {} returned {}, progress will be indeterminate",
                    url,
                    response.status()
                );
                None
            }
            Err(e) => {
                warn!("Size probe for {} failed: {}", url, e);
                None
            }
        }
    }
}

// `Response::content_length` reports the body's size hint, which is zero for HEAD.
fn header_length(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::testing::{Recorded, RecordingProgress};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Clone)]
    struct Route {
        head: u16,
        get: u16,
        body: Vec<u8>,
        /// Announce more bytes than are sent, then hang.
        stall: bool,
    }

    async fn serve(route: Route) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let route = route.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        request.extend_from_slice(&buf[..n]);
                    }

                    let head = request.starts_with(b"HEAD");
                    let status = if head { route.head } else { route.get };
                    let length = if route.stall {
                        route.body.len() * 100
                    } else {
                        route.body.len()
                    };
                    let header = format!(
                        "HTTP/1.1 {} Test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        status,
                        if status == 200 { length } else { 0 }
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    if !head && status == 200 {
                        let _ = socket.write_all(&route.body).await;
                        if route.stall {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}/ext_tw_video/1/vid/1280x720/clip.mp4", addr)
    }

    #[tokio::test]
    async fn failed_size_probe_still_completes_indeterminately() {
        let body = vec![7u8; 64 * 1024];
        let url = serve(Route {
            head: 500,
            get: 200,
            body: body.clone(),
            stall: false,
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("nested").join("clip.mp4");
        let sink = Arc::new(RecordingProgress::default());

        let written = Downloader::new(reqwest::Client::new())
            .with_progress(sink.clone())
            .download(&url, &destination)
            .await
            .unwrap();

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&destination).unwrap(), body);

        let events = sink.events();
        assert!(events.iter().all(|event| match event {
            Recorded::Transfer { total, .. } => total.is_none(),
            _ => true,
        }));
        assert!(events.contains(&Recorded::Transfer {
            downloaded: body.len() as u64,
            total: None,
        }));
        assert!(matches!(events.last(), Some(Recorded::Finish(_))));
    }

    #[tokio::test]
    async fn size_probe_supplies_the_total() {
        let body = b"not really an mp4".to_vec();
        let url = serve(Route {
            head: 200,
            get: 200,
            body: body.clone(),
            stall: false,
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingProgress::default());

        Downloader::new(reqwest::Client::new())
            .with_progress(sink.clone())
            .download(&url, &dir.path().join("clip.mp4"))
            .await
            .unwrap();

        assert!(sink.events().contains(&Recorded::Transfer {
            downloaded: body.len() as u64,
            total: Some(body.len() as u64),
        }));
    }

    #[tokio::test]
    async fn error_status_is_a_transfer_error() {
        let url = serve(Route {
            head: 404,
            get: 404,
            body: Vec::new(),
            stall: false,
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("clip.mp4");
        let sink = Arc::new(RecordingProgress::default());

        let err = Downloader::new(reqwest::Client::new())
            .with_progress(sink.clone())
            .download(&url, &destination)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transfer { status: 404, .. }));
        assert!(!destination.exists());
        assert!(matches!(sink.events().last(), Some(Recorded::Abandon(_))));
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let url = serve(Route {
            head: 200,
            get: 200,
            body: Vec::new(),
            stall: false,
        })
        .await;
        let dir = tempfile::tempdir().unwrap();

        let err = Downloader::new(reqwest::Client::new())
            .download(&url, &dir.path().join("clip.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyBody(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_a_stalled_transfer() {
        let url = serve(Route {
            head: 200,
            get: 200,
            body: vec![1u8; 4096],
            stall: true,
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("clip.mp4");
        let cancel = CancellationToken::new();
        let sink = Arc::new(RecordingProgress::default());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = Downloader::new(reqwest::Client::new())
            .with_progress(sink.clone())
            .with_cancellation(cancel)
            .download(&url, &destination)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
        // Partial output stays on disk.
        assert!(destination.exists());
        assert_eq!(
            sink.events().last(),
            Some(&Recorded::Abandon("Download interrupted".to_string()))
        );
    }
}
