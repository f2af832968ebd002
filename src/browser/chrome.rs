//! A [`Renderer`] that drives Chrome or Chromium over the DevTools Protocol.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::{PageResponse, PageSession, Renderer, ResponseHandler, WaitUntil};
use crate::error::{Error, Result};

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const IDLE_WINDOW: Duration = Duration::from_millis(500);
const IDLE_MAX_INFLIGHT: usize = 2;
const BODY_ATTEMPTS: usize = 20;

const EXECUTABLE_NAMES: [&str; 6] = [
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
    "msedge",
];

/// Launches a throw-away Chrome profile per session.
#[derive(Debug, Clone)]
pub struct ChromeRenderer {
    /// The browser executable.
    pub executable: PathBuf,
    /// Whether to hide the browser window.
    pub headless: bool,
    /// Where temporary profiles are created.
    pub scratch_dir: PathBuf,
}

impl ChromeRenderer {
    pub fn new(
        executable: impl Into<PathBuf>,
        headless: bool,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executable: executable.into(),
            headless,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Looks for a Chrome-family browser in the usual places.
    pub fn detect_executable() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            let path = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
            if path.exists() {
                return Some(path);
            }
        }
        #[cfg(target_os = "windows")]
        {
            for var in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
                if let Ok(root) = std::env::var(var) {
                    let path = PathBuf::from(root).join("Google/Chrome/Application/chrome.exe");
                    if path.exists() {
                        return Some(path);
                    }
                }
            }
        }

        EXECUTABLE_NAMES
            .iter()
            .find_map(|name| which::which(name).ok())
    }

    fn args(&self, profile_dir: &Path) -> Vec<String> {
        let mut args = vec![
            format!("--user-data-dir={}", profile_dir.display()),
            "--remote-debugging-port=0".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-crash-reporter".to_string(),
            "--mute-audio".to_string(),
            "--autoplay-policy=no-user-gesture-required".to_string(),
            "--window-size=1280,900".to_string(),
        ];
        if self.headless {
            args.push("--headless=new".to_string());
        }
        if !cfg!(target_os = "macos") {
            args.push("--no-sandbox".to_string());
        }
        args.push("about:blank".to_string());
        args
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn open(&self) -> Result<Arc<dyn PageSession>> {
        let session = ChromeSession::launch(self).await?;
        Ok(Arc::new(session))
    }
}

type Reply = std::result::Result<Value, String>;

/// The websocket to the browser, shared by the page and its tasks.
struct Connection {
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
}

impl Connection {
    async fn call(&self, session_id: Option<&str>, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            message["sessionId"] = json!(session_id);
        }
        trace!("-> {}", message);

        if self.outgoing.send(Message::text(message.to_string())).is_err() {
            self.forget(id);
            return Err(Error::Browser("DevTools connection is closed".to_string()));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(Error::Protocol {
                method: method.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(Error::Browser(format!(
                "DevTools connection closed during {}",
                method
            ))),
            Err(_) => {
                self.forget(id);
                Err(Error::Timeout(COMMAND_TIMEOUT))
            }
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Routes a command reply to its waiter. Returns `false` for events.
    fn resolve(&self, message: &Value) -> bool {
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            return false;
        };
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(waiter) = waiter {
            let reply = match message.get("error") {
                Some(error) => Err(error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string()),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = waiter.send(reply);
        }
        true
    }
}

/// Bookkeeping updated from DevTools events.
#[derive(Default)]
struct PageState {
    handlers: RwLock<Vec<Arc<dyn ResponseHandler>>>,
    inflight: Mutex<HashSet<String>>,
    loaded: AtomicBool,
}

impl PageState {
    fn inflight(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// One Chrome process with a single attached page.
pub struct ChromeSession {
    connection: Arc<Connection>,
    session_id: String,
    state: Arc<PageState>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    profile_dir: PathBuf,
    closed: AtomicBool,
}

impl ChromeSession {
    /// Starts the browser, connects to it and opens a page.
    pub async fn launch(renderer: &ChromeRenderer) -> Result<Self> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let profile_dir = renderer
            .scratch_dir
            .join(format!("chrome-profile-{}-{}", std::process::id(), millis));
        tokio::fs::create_dir_all(&profile_dir).await?;

        debug!(
            "Launching {} (headless: {})",
            renderer.executable.display(),
            renderer.headless
        );
        let mut child = Command::new(&renderer.executable)
            .args(renderer.args(&profile_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Browser(format!(
                    "Failed to launch {}: {}",
                    renderer.executable.display(),
                    e
                ))
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Browser("Failed to capture browser stderr".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();
        let ws_url = tokio::time::timeout(LAUNCH_TIMEOUT, devtools_url(&mut lines))
            .await
            .map_err(|_| Error::Timeout(LAUNCH_TIMEOUT))??;
        debug!("DevTools endpoint: {}", ws_url);

        let mut tasks = Vec::new();
        // Chrome blocks once its stderr pipe fills up, so keep draining it.
        tasks.push(tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!("chrome: {}", line);
            }
        }));

        let (socket, _) = connect_async(ws_url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        tasks.push(tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("DevTools write failed: {}", e);
                    break;
                }
            }
        }));

        let connection = Arc::new(Connection {
            next_id: AtomicU64::new(1),
            outgoing,
            pending: Mutex::new(HashMap::new()),
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Value>();
        let reader_connection = Arc::clone(&connection);
        tasks.push(tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("DevTools read failed: {}", e);
                        break;
                    }
                };
                let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                if !reader_connection.resolve(&value) && events_tx.send(value).is_err() {
                    break;
                }
            }
            // Fail every outstanding command instead of leaving it to time out.
            reader_connection
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }));

        let target = connection
            .call(None, "Target.createTarget", json!({ "url": "about:blank" }))
            .await?;
        let target_id = target
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Browser("Target.createTarget returned no targetId".to_string()))?
            .to_string();
        let attached = connection
            .call(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Browser("Target.attachToTarget returned no sessionId".to_string())
            })?
            .to_string();

        let state = Arc::new(PageState::default());
        let dispatcher = EventDispatcher {
            connection: Arc::clone(&connection),
            session_id: session_id.clone(),
            state: Arc::clone(&state),
        };
        tasks.push(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                dispatcher.dispatch(event);
            }
        }));

        let session = Self {
            connection,
            session_id,
            state,
            child: tokio::sync::Mutex::new(Some(child)),
            tasks: Mutex::new(tasks),
            profile_dir,
            closed: AtomicBool::new(false),
        };

        for domain in ["Page.enable", "Network.enable", "Runtime.enable"] {
            if let Err(e) = session.call(domain, json!({})).await {
                let _ = session.close().await;
                return Err(e);
            }
        }

        Ok(session)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.connection
            .call(Some(&self.session_id), method, params)
            .await
    }

    async fn wait_for_navigation(&self, wait_until: WaitUntil) {
        let mut idle_since: Option<Instant> = None;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if !self.state.loaded.load(Ordering::SeqCst) {
                continue;
            }
            if wait_until == WaitUntil::Load {
                return;
            }
            if self.state.inflight() <= IDLE_MAX_INFLIGHT {
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= IDLE_WINDOW {
                    return;
                }
            } else {
                idle_since = None;
            }
        }
    }

    fn abort_tasks(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

/// Waits for the line Chrome prints once its DevTools server listens.
async fn devtools_url(lines: &mut Lines<BufReader<ChildStderr>>) -> Result<String> {
    while let Some(line) = lines.next_line().await? {
        trace!("chrome: {}", line);
        if let Some(url) = line.trim().strip_prefix("DevTools listening on ") {
            return Ok(url.trim().to_string());
        }
    }
    Err(Error::Browser(
        "Browser exited before DevTools became available".to_string(),
    ))
}

#[async_trait]
impl PageSession for ChromeSession {
    async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.call(
            "Network.setUserAgentOverride",
            json!({ "userAgent": user_agent }),
        )
        .await?;
        Ok(())
    }

    async fn set_extra_headers(&self, headers: &HashMap<String, String>) -> Result<()> {
        self.call("Network.setExtraHTTPHeaders", json!({ "headers": headers }))
            .await?;
        Ok(())
    }

    async fn set_request_interception(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.call(
                "Fetch.enable",
                json!({ "patterns": [{ "urlPattern": "*", "requestStage": "Request" }] }),
            )
            .await?;
        } else {
            self.call("Fetch.disable", json!({})).await?;
        }
        Ok(())
    }

    fn add_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
        self.state
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    async fn goto(&self, url: &str, timeout: Duration, wait_until: WaitUntil) -> Result<()> {
        self.state.loaded.store(false, Ordering::SeqCst);
        let navigation = self.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(error) = navigation.get("errorText").and_then(Value::as_str) {
            return Err(Error::Browser(format!("Navigation to {} failed: {}", url, error)));
        }

        tokio::time::timeout(timeout, self.wait_for_navigation(wait_until))
            .await
            .map_err(|_| Error::Timeout(timeout))
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": script,
                    "returnByValue": true,
                    "awaitPromise": true,
                    "userGesture": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let message = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("script threw");
            return Err(Error::Browser(format!("Script failed: {}", message)));
        }

        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let script = format!(
            "document.querySelector({}) !== null",
            serde_json::to_string(selector)?
        );
        let deadline = Instant::now() + timeout;
        loop {
            match self.evaluate(&script).await {
                Ok(Value::Bool(true)) => return Ok(true),
                Ok(_) => {}
                // The context can vanish mid-navigation; keep polling.
                Err(e) => trace!("Selector probe for {} failed: {}", selector, e),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing browser session");

        let farewell = self.connection.call(None, "Browser.close", json!({}));
        if tokio::time::timeout(Duration::from_secs(3), farewell)
            .await
            .is_err()
        {
            debug!("Browser.close did not answer in time");
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("Browser process already gone: {}", e);
            }
        }
        self.abort_tasks();

        if let Err(e) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            debug!(
                "Could not remove profile {}: {}",
                self.profile_dir.display(),
                e
            );
        }
        Ok(())
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        // The child is killed on drop; only the background tasks need stopping.
        self.abort_tasks();
    }
}

/// Turns DevTools events into page state and handler calls.
struct EventDispatcher {
    connection: Arc<Connection>,
    session_id: String,
    state: Arc<PageState>,
}

impl EventDispatcher {
    fn dispatch(&self, event: Value) {
        if event.get("sessionId").and_then(Value::as_str) != Some(self.session_id.as_str()) {
            return;
        }
        let Some(method) = event.get("method").and_then(Value::as_str) else {
            return;
        };
        let params = event.get("params").cloned().unwrap_or(Value::Null);
        let request_id = params
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);

        match method {
            "Fetch.requestPaused" => {
                let Some(request_id) = request_id else { return };
                let connection = Arc::clone(&self.connection);
                let session_id = self.session_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection
                        .call(
                            Some(&session_id),
                            "Fetch.continueRequest",
                            json!({ "requestId": request_id }),
                        )
                        .await
                    {
                        trace!("Could not continue request: {}", e);
                    }
                });
            }
            "Network.requestWillBeSent" => {
                if let Some(request_id) = request_id {
                    self.state
                        .inflight
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(request_id);
                }
            }
            "Network.loadingFinished" | "Network.loadingFailed" => {
                if let Some(request_id) = request_id {
                    self.state
                        .inflight
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&request_id);
                }
            }
            "Network.responseReceived" => {
                let Some(request_id) = request_id else { return };
                let response = ChromeResponse::from_event(
                    Arc::clone(&self.connection),
                    self.session_id.clone(),
                    request_id,
                    &params,
                );
                let handlers = self
                    .state
                    .handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if handlers.is_empty() {
                    return;
                }
                let response = Arc::new(response);
                for handler in handlers {
                    let response = Arc::clone(&response);
                    tokio::spawn(async move {
                        handler.on_response(response.as_ref()).await;
                    });
                }
            }
            "Page.loadEventFired" => self.state.loaded.store(true, Ordering::SeqCst),
            "Inspector.detached" => warn!("Browser page detached"),
            _ => {}
        }
    }
}

/// A response as reported by `Network.responseReceived`.
struct ChromeResponse {
    connection: Arc<Connection>,
    session_id: String,
    request_id: String,
    url: String,
    status: u16,
    headers: HashMap<String, String>,
}

impl ChromeResponse {
    fn from_event(
        connection: Arc<Connection>,
        session_id: String,
        request_id: String,
        params: &Value,
    ) -> Self {
        let response = params.get("response").cloned().unwrap_or(Value::Null);
        let mut headers: HashMap<String, String> = response
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| Some((k.to_ascii_lowercase(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(mime) = response.get("mimeType").and_then(Value::as_str) {
            headers
                .entry("content-type".to_string())
                .or_insert_with(|| mime.to_string());
        }

        Self {
            connection,
            session_id,
            request_id,
            url: response
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: response
                .get("status")
                .and_then(Value::as_u64)
                .unwrap_or_default() as u16,
            headers,
        }
    }
}

#[async_trait]
impl PageResponse for ChromeResponse {
    fn url(&self) -> &str {
        &self.url
    }

    fn status(&self) -> u16 {
        self.status
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    async fn text(&self) -> Result<String> {
        // The body only becomes available once loading has finished.
        let mut attempt = 0;
        let body = loop {
            match self
                .connection
                .call(
                    Some(&self.session_id),
                    "Network.getResponseBody",
                    json!({ "requestId": self.request_id }),
                )
                .await
            {
                Ok(body) => break body,
                Err(Error::Protocol { .. }) if attempt + 1 < BODY_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(e) => return Err(e),
            }
        };

        let text = body
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if body.get("base64Encoded").and_then(Value::as_bool) == Some(true) {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| Error::Browser(format!("Undecodable response body: {}", e)))?;
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(text.to_string())
    }
}
