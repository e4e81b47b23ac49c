// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Reverse Tunnel Contributors

// Reverse Tunnel - Tunnel Session Manager
// Drives one tunnel run: connect, bind on the server, accept and forward

use std::sync::Arc;
use std::time::Duration;

use reverse_tunnel_common::{Reporter, TunnelRequest, TunnelState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TunnelError};
use crate::listener::{PendingRemoteConnection, RemoteListener};
use crate::pairer::{ConnectionPairer, LocalDialer};
use crate::session::{self, AuthMethod, Connector, SecureSession};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-run tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Covers TCP connect, handshake and authentication
    pub connect_timeout: Duration,
    /// Maximum concurrently forwarded connections (None = unlimited)
    pub max_connections: Option<usize>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connections: None,
        }
    }
}

/// How the accept loop ended
enum Stop {
    Cancelled,
    Failed(TunnelError),
}

/// Orchestrates one tunnel per `run` and reports progress on a `Reporter`
pub struct TunnelSessionManager {
    connector: Arc<dyn Connector>,
    dialer: Arc<dyn LocalDialer>,
    reporter: Arc<dyn Reporter>,
    options: SessionOptions,
    state: watch::Sender<TunnelState>,
}

impl TunnelSessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        dialer: Arc<dyn LocalDialer>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Idle);
        Self {
            connector,
            dialer,
            reporter,
            options: SessionOptions::default(),
            state,
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    /// Run the tunnel until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// Every transition and every error is reported exactly once. Returns
    /// `Ok(())` when stopped by `shutdown`, the fatal error otherwise.
    /// Forwarded connections still open when the run ends keep draining.
    pub async fn run(&self, request: &TunnelRequest, shutdown: CancellationToken) -> Result<()> {
        self.state.send_replace(TunnelState::Idle);

        // Nothing touches the network before the request is known good
        let target = match request.validate() {
            Ok(target) => target,
            Err(e) => return self.fail(e.into()),
        };
        let auth = match AuthMethod::from_request(request) {
            Ok(auth) => auth,
            Err(e) => return self.fail(e),
        };

        self.transition(TunnelState::Connecting, format!("connecting to {}", target.remote));
        let connecting = session::connect(
            self.connector.as_ref(),
            &target.remote,
            &request.user,
            &auth,
            self.options.connect_timeout,
        );
        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = connecting => Some(result),
        };
        let mut session: Box<dyn SecureSession> = match connected {
            None => return Ok(self.cancelled()),
            Some(Ok(session)) => session,
            Some(Err(e)) => return self.fail(e),
        };

        self.transition(TunnelState::Authenticated, format!("connected to {}", target.remote));

        self.state.send_replace(TunnelState::Listening);
        let bound = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = session.listen_on_remote(&target.bind) => Some(result),
        };
        let listener = match bound {
            None => {
                session.close().await;
                return Ok(self.cancelled());
            }
            Some(Ok(listener)) => listener,
            Some(Err(e)) => {
                session.close().await;
                return self.fail(e);
            }
        };

        self.transition(TunnelState::Accepting, format!("listening on {}", listener.bind()));

        let pairer = Arc::new(
            ConnectionPairer::new(target.local.clone(), self.dialer.clone())
                .with_limit(self.options.max_connections),
        );
        let stop = self.accept_loop(&listener, &pairer, &shutdown).await;

        // Listener first: releasing the bind needs a live transport
        listener.close().await;
        session.close().await;
        debug!(
            "Tunnel to {} torn down with {} connections still draining",
            target.remote,
            pairer.active_pairs()
        );

        match stop {
            Stop::Cancelled => Ok(self.cancelled()),
            Stop::Failed(e) => self.fail(e),
        }
    }

    /// Run on a background task; the returned handle stops and joins it
    pub fn spawn(self: Arc<Self>, request: TunnelRequest) -> TunnelHandle {
        let shutdown = CancellationToken::new();
        let state = self.subscribe();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { self.run(&request, shutdown).await }
        });
        TunnelHandle {
            shutdown,
            state,
            task,
        }
    }

    async fn accept_loop(
        &self,
        listener: &RemoteListener,
        pairer: &Arc<ConnectionPairer>,
        shutdown: &CancellationToken,
    ) -> Stop {
        let mut stopping = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled(), if !stopping => None,
                next = listener.accept_next() => Some(next),
            };

            match next {
                None => {
                    // Wakes the accept below with Closed
                    debug!("Stop requested; releasing {}", listener.bind());
                    stopping = true;
                    listener.close().await;
                }
                Some(Ok(pending)) => {
                    self.reporter
                        .report(&format!("accepted connection from {}", pending.origin()));
                    self.dispatch(pairer.clone(), pending);
                }
                Some(Err(_)) if stopping => return Stop::Cancelled,
                Some(Err(e)) if e.is_terminal() => return Stop::Failed(e.into()),
                Some(Err(e)) => {
                    let e = TunnelError::from(e);
                    warn!("{}", e);
                    self.reporter.report(&e.to_string());
                }
            }
        }
    }

    /// Pair on its own task so a slow local dial never stalls accepting
    fn dispatch(&self, pairer: Arc<ConnectionPairer>, pending: PendingRemoteConnection) {
        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            match pairer.pair(pending).await {
                Ok(pair) => debug!("Forwarding connection {} from {}", pair.id(), pair.origin()),
                Err(e) => {
                    warn!("{}", e);
                    reporter.report(&e.to_string());
                }
            }
        });
    }

    /// Report first so watchers never see a state before its line
    fn transition(&self, state: TunnelState, line: String) {
        info!("{} ({})", line, state);
        self.reporter.report(&line);
        self.state.send_replace(state);
    }

    /// Report a fatal error as the run's last line
    fn fail(&self, e: TunnelError) -> Result<()> {
        error!("Tunnel stopped: {}", e);
        self.reporter.report(&e.to_string());
        self.state.send_replace(TunnelState::Stopped);
        Err(e)
    }

    fn cancelled(&self) {
        self.transition(TunnelState::Stopped, "tunnel stopped".to_string());
    }
}

/// A tunnel run on a background task
pub struct TunnelHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<TunnelState>,
    task: JoinHandle<Result<()>>,
}

impl TunnelHandle {
    /// Request a stop; `join` returns once teardown is done
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .unwrap_or_else(|e| Err(TunnelError::Task(e.to_string())))
    }
}
