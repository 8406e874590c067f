//! Loopback listener for the OAuth redirect, raced against a console prompt.
//!
//! Whichever delivers an authorization code first wins. The loser is told to
//! stop through a `watch` signal and the listener is shut down with a short
//! grace period so the browser still receives its confirmation page.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = "<html><body><h1>Successfully authenticated</h1>\
<p>You may close this tab.</p></body></html>";
const INVALID_PAGE: &str = "<html><body><h1>Invalid authentication code</h1>\
<p>Return to the terminal and run <code>mailprint auth</code> again.</p></body></html>";

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Failed to bind the auth callback listener on {addr}: {source}. Is another program using the port? Change 'callbackPort' in the config")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Authorization was cancelled")]
    Cancelled,

    #[error("Timed out waiting for an authorization code")]
    Timeout,

    #[error("The auth callback carried no authorization code")]
    EmptyCode,

    #[error("The provider reported an authorization error: {0}")]
    Denied(String),

    #[error("The auth callback state did not match this request")]
    StateMismatch,

    #[error("Both the listener and the console closed before a code arrived")]
    Closed,

    #[error("This callback has already completed")]
    AlreadyUsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    Idle,
    Listening,
    CodeReceived,
    Cancelled,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSource {
    Callback,
    Console,
}

#[derive(Clone)]
pub struct AuthorizationCode {
    pub code: String,
    pub source: CodeSource,
}

impl std::fmt::Debug for AuthorizationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationCode")
            .field("code", &"[REDACTED]")
            .field("source", &self.source)
            .finish()
    }
}

enum Event {
    Code(AuthorizationCode),
    Rejected(CallbackError),
}

#[derive(Clone)]
struct HandlerState {
    events: mpsc::Sender<Event>,
    expected_state: Arc<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

pub struct AuthCallback {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    path: String,
    expected_state: Option<String>,
    state: CallbackState,
}

impl AuthCallback {
    /// Binds the listener. `path` is the single route served, e.g.
    /// `/auth/callback/google`.
    pub async fn bind(addr: SocketAddr, path: impl Into<String>) -> Result<Self, CallbackError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CallbackError::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| CallbackError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

        Ok(Self {
            listener: Some(listener),
            local_addr,
            path: path.into(),
            expected_state: None,
            state: CallbackState::Idle,
        })
    }

    /// Rejects callbacks whose `state` parameter differs from `state`.
    pub fn with_expected_state(mut self, state: impl Into<String>) -> Self {
        self.expected_state = Some(state.into());
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> CallbackState {
        self.state
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}{}", self.local_addr.port(), self.path)
    }

    /// Waits for the first authorization code from either the loopback
    /// listener or `console`. Runs once per callback.
    pub async fn await_code<R>(
        &mut self,
        console: R,
        timeout: Option<Duration>,
        cancel: watch::Receiver<bool>,
    ) -> Result<AuthorizationCode, CallbackError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let listener = match (self.state, self.listener.take()) {
            (CallbackState::Idle, Some(listener)) => listener,
            _ => return Err(CallbackError::AlreadyUsed),
        };
        self.state = CallbackState::Listening;
        log::debug!("Auth callback listening on {}{}", self.local_addr, self.path);

        let (events_tx, mut events_rx) = mpsc::channel::<Event>(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let app = Router::new()
            .route(&self.path, get(handle_callback))
            .with_state(HandlerState {
                events: events_tx.clone(),
                expected_state: Arc::new(self.expected_state.clone()),
            });

        let server_stop = stop_rx.clone();
        let mut server: JoinHandle<std::io::Result<()>> = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(stopped(server_stop))
                .await
        });
        let console_task = tokio::spawn(read_console(console, events_tx, stop_rx));

        let deadline = async {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            event = events_rx.recv() => match event {
                Some(Event::Code(code)) => Ok(code),
                Some(Event::Rejected(err)) => Err(err),
                None => Err(CallbackError::Closed),
            },
            _ = deadline => Err(CallbackError::Timeout),
            _ = cancelled(cancel) => Err(CallbackError::Cancelled),
        };

        self.state = match &outcome {
            Ok(_) => CallbackState::CodeReceived,
            Err(CallbackError::Timeout) => CallbackState::TimedOut,
            Err(CallbackError::Cancelled) => CallbackState::Cancelled,
            Err(_) => CallbackState::Failed,
        };

        let _ = stop_tx.send(true);
        console_task.abort();

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => log::warn!("Auth callback listener failed: {}", e),
            Ok(Err(e)) => log::warn!("Auth callback listener task failed: {}", e),
            Err(_) => {
                log::warn!(
                    "Auth callback listener did not shut down within {:?}, aborting",
                    SHUTDOWN_GRACE
                );
                server.abort();
            }
        }

        match &outcome {
            Ok(code) => log::info!("Received authorization code via {:?}", code.source),
            Err(e) => log::debug!("Auth callback finished without a code: {}", e),
        }
        outcome
    }
}

async fn handle_callback(
    State(handler): State<HandlerState>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<&'static str>) {
    let expected = handler.expected_state.as_ref();
    let event = if let Some(error) = params.error.filter(|e| !e.is_empty()) {
        Event::Rejected(CallbackError::Denied(error))
    } else if expected.is_some() && params.state.as_ref() != expected.as_ref() {
        Event::Rejected(CallbackError::StateMismatch)
    } else {
        match params.code.map(|c| c.trim().to_string()) {
            Some(code) if !code.is_empty() => Event::Code(AuthorizationCode {
                code,
                source: CodeSource::Callback,
            }),
            _ => Event::Rejected(CallbackError::EmptyCode),
        }
    };

    let response = match &event {
        Event::Code(_) => (StatusCode::OK, Html(SUCCESS_PAGE)),
        Event::Rejected(_) => (StatusCode::BAD_REQUEST, Html(INVALID_PAGE)),
    };
    // The receiver is gone once another source has won
    let _ = handler.events.send(event).await;
    response
}

async fn read_console<R>(console: R, events: mpsc::Sender<Event>, mut stop: watch::Receiver<bool>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut lines = console.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(code) = code_from_console(&line) {
                        let _ = events
                            .send(Event::Code(AuthorizationCode {
                                code,
                                source: CodeSource::Console,
                            }))
                            .await;
                        return;
                    }
                }
                // EOF: leave the listener to deliver the code
                Ok(None) => return,
                Err(e) => {
                    log::warn!("Failed to read authorization code from console: {}", e);
                    return;
                }
            },
            _ = stop.changed() => return,
        }
    }
}

/// Accepts either the bare code or the full redirect URL pasted from the
/// browser's address bar.
fn code_from_console(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Ok(url) = url::Url::parse(line) {
        if url.scheme().starts_with("http") {
            return url
                .query_pairs()
                .find(|(key, _)| key == "code")
                .map(|(_, value)| value.trim().to_string())
                .filter(|code| !code.is_empty());
        }
    }
    Some(line.to_string())
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves once `cancel` turns true. A dropped sender never cancels.
pub(crate) async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
