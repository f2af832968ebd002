//! The rendering capability used to observe what a post loads.
//!
//! Discovery only depends on the traits in this module. [`chrome`] provides
//! the real implementation on top of the Chrome DevTools Protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub mod chrome;

pub use chrome::ChromeRenderer;

/// When a navigation counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// The page fired its load event.
    Load,
    /// Loaded, and no more than two requests have been in flight for 500 ms.
    NetworkIdle,
}

/// A response observed while the page rendered.
#[async_trait]
pub trait PageResponse: Send + Sync {
    fn url(&self) -> &str;
    fn status(&self) -> u16;
    /// Looks a header up case-insensitively.
    fn header(&self, name: &str) -> Option<&str>;

    async fn text(&self) -> Result<String>;

    async fn json(&self) -> Result<Value> {
        let text = self.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Called for every response; may run concurrently with the caller's awaits.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn on_response(&self, response: &dyn PageResponse);
}

/// One open page in a launched browser.
#[async_trait]
pub trait PageSession: Send + Sync {
    async fn set_user_agent(&self, user_agent: &str) -> Result<()>;

    async fn set_extra_headers(&self, headers: &HashMap<String, String>) -> Result<()>;

    /// Pauses every outgoing request and lets it continue unchanged.
    async fn set_request_interception(&self, enabled: bool) -> Result<()>;

    fn add_response_handler(&self, handler: Arc<dyn ResponseHandler>);

    async fn goto(&self, url: &str, timeout: Duration, wait_until: WaitUntil) -> Result<()>;

    /// Evaluates `script` in the page and returns its JSON value.
    async fn evaluate(&self, script: &str) -> Result<Value>;

    /// Waits until `selector` matches an element. `Ok(false)` means the wait ran out.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool>;

    /// Shuts the browser down. Calling it twice is harmless.
    async fn close(&self) -> Result<()>;
}

/// Something that can start a browser and hand out a page.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn PageSession>>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory page that replays canned responses and script results.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::Error;

    #[derive(Debug, Clone, Default)]
    pub struct FakeResponse {
        pub url: String,
        pub status: u16,
        pub content_type: Option<String>,
        pub body: String,
    }

    impl FakeResponse {
        pub fn new(url: &str, content_type: &str) -> Self {
            Self {
                url: url.to_string(),
                status: 200,
                content_type: Some(content_type.to_string()),
                body: String::new(),
            }
        }

        pub fn with_body(mut self, body: &str) -> Self {
            self.body = body.to_string();
            self
        }
    }

    #[async_trait]
    impl PageResponse for FakeResponse {
        fn url(&self) -> &str {
            &self.url
        }

        fn status(&self) -> u16 {
            self.status
        }

        fn header(&self, name: &str) -> Option<&str> {
            if name.eq_ignore_ascii_case("content-type") {
                self.content_type.as_deref()
            } else {
                None
            }
        }

        async fn text(&self) -> Result<String> {
            Ok(self.body.clone())
        }
    }

    /// Replays `responses` on navigation and `click_responses` when the
    /// matching selector is clicked.
    #[derive(Default)]
    pub struct ScriptedSession {
        pub responses: Vec<FakeResponse>,
        pub click_responses: Vec<FakeResponse>,
        pub selector_match: Option<String>,
        pub dom_videos: Vec<String>,
        pub resources: Vec<String>,
        pub meta: Option<String>,
        pub goto_fails: bool,
        pub handlers: Mutex<Vec<Arc<dyn ResponseHandler>>>,
        pub scripts: Mutex<Vec<String>>,
        pub closes: AtomicUsize,
    }

    impl ScriptedSession {
        async fn deliver(&self, responses: &[FakeResponse]) {
            let handlers = self.handlers.lock().unwrap().clone();
            for handler in handlers {
                for response in responses {
                    handler.on_response(response).await;
                }
            }
        }

        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub fn ran_script(&self, needle: &str) -> bool {
            self.scripts
                .lock()
                .unwrap()
                .iter()
                .any(|script| script.contains(needle))
        }
    }

    #[async_trait]
    impl PageSession for ScriptedSession {
        async fn set_user_agent(&self, _user_agent: &str) -> Result<()> {
            Ok(())
        }

        async fn set_extra_headers(&self, _headers: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }

        async fn set_request_interception(&self, _enabled: bool) -> Result<()> {
            Ok(())
        }

        fn add_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
            self.handlers.lock().unwrap().push(handler);
        }

        async fn goto(&self, _url: &str, timeout: Duration, _wait_until: WaitUntil) -> Result<()> {
            self.deliver(&self.responses).await;
            if self.goto_fails {
                return Err(Error::Timeout(timeout));
            }
            Ok(())
        }

        async fn evaluate(&self, script: &str) -> Result<Value> {
            self.scripts.lock().unwrap().push(script.to_string());
            if script.contains(".click()") {
                let matched = self.selector_match.as_ref().is_some_and(|selector| {
                    script.contains(&serde_json::to_string(selector).unwrap())
                });
                if matched {
                    self.deliver(&self.click_responses).await;
                }
                return Ok(Value::Bool(matched));
            }
            if script.contains("getEntriesByType") {
                return Ok(json!(self.resources));
            }
            if script.contains("meta[") {
                return Ok(json!(self.meta));
            }
            if script.contains("querySelectorAll('video')") {
                return Ok(json!(self.dom_videos));
            }
            Err(Error::Browser(format!("unexpected script: {}", script)))
        }

        async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
            if self.selector_match.as_deref() == Some(selector) {
                return Ok(true);
            }
            tokio::time::sleep(timeout).await;
            Ok(false)
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands out the same scripted page on every open.
    pub struct ScriptedRenderer {
        pub session: Arc<ScriptedSession>,
        pub opens: AtomicUsize,
        pub fail: bool,
    }

    impl ScriptedRenderer {
        pub fn new(session: ScriptedSession) -> Self {
            Self {
                session: Arc::new(session),
                opens: AtomicUsize::new(0),
                fail: false,
            }
        }

        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Renderer for ScriptedRenderer {
        async fn open(&self) -> Result<Arc<dyn PageSession>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Browser("no browser available".to_string()));
            }
            Ok(self.session.clone())
        }
    }
}
