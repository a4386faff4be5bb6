// ============================================================================
// SERVER LIFECYCLE
// ============================================================================
// Wires the gateway together and runs it:
// - opens the library store and starts one worker per enabled provider
// - serves the API on a TCP or Unix socket listener
// - maps process signals to shutdown and provider refreshes
// - drains the HTTP server within the graceful timeout, then stops workers
// ============================================================================

use std::fs;
use std::future::{Future, IntoFuture};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use nix::unistd::{chown, Group, User};
use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{router, AppState};
use crate::catalog::Catalog;
use crate::config::{GatewayConfig, ListenAddress};
use crate::error::{ConfigError, FacetteError, FacetteResult};
use crate::poller::Poller;
use crate::storage::Store;
use crate::VERSION;

pub struct Server {
    state: AppState,
    listen: ListenAddress,
    graceful_timeout: Duration,
    shutdown: CancellationToken,
}

impl Server {
    /// Open the store and build the shared state. Workers are not started yet.
    pub fn new(config: GatewayConfig) -> FacetteResult<Self> {
        config.validate()?;

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let listen = ListenAddress::parse(&config.http.listen)?;
        let graceful_timeout = config.http.graceful_timeout();

        let store = Arc::new(Store::open(config.storage.path.as_deref())?);
        let catalog = Arc::new(Catalog::new());
        let poller = Arc::new(Poller::new(
            catalog,
            instance_id.clone(),
            Duration::from_secs(config.defaults.connector_timeout),
        ));

        info!(
            target: "facette::server",
            instance = %instance_id,
            storage = ?config.storage.path,
            "Gateway initialized"
        );

        Ok(Self {
            state: AppState::new(config, store, poller, &instance_id),
            listen,
            graceful_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Token cancelling the server; cancelled by termination signals.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start a worker for every enabled provider of the library. Providers
    /// whose connector cannot be built are logged and skipped.
    pub async fn start_providers(&self) -> usize {
        let providers: Vec<_> = self
            .state
            .store
            .read(|library| library.providers.values().cloned().collect());

        let mut started = 0;
        for provider in providers.iter().filter(|p| p.enabled) {
            match self.state.poller.start_worker(provider).await {
                Ok(()) => started += 1,
                Err(e) => error!(
                    target: "facette::server",
                    provider = %provider.item.name,
                    error = %e,
                    "Unable to start provider"
                ),
            }
        }

        info!(
            target: "facette::server",
            started,
            total = providers.len(),
            "Providers started"
        );
        started
    }

    /// Serve until the shutdown token is cancelled, then drain and stop.
    pub async fn run(self) -> FacetteResult<()> {
        self.start_providers().await;

        let signals = tokio::spawn(handle_signals(
            self.shutdown.clone(),
            self.state.poller.clone(),
        ));

        let result = self.serve().await;

        // The server may have stopped on an error rather than a signal.
        self.shutdown.cancel();
        signals.abort();

        let started = Instant::now();
        self.state.poller.shutdown().await;
        info!(
            target: "facette::server",
            duration_ms = started.elapsed().as_millis() as u64,
            "Gateway stopped"
        );

        result
    }

    async fn serve(&self) -> FacetteResult<()> {
        let app = router(self.state.clone());
        match &self.listen {
            ListenAddress::Tcp(address) => {
                let listener = TcpListener::bind(address).await?;
                info!(
                    target: "facette::server",
                    address = %listener.local_addr()?,
                    base_path = %self.state.config.http.base_path,
                    version = VERSION,
                    "Listening"
                );
                let serve = axum::serve(listener, app)
                    .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
                    .into_future();
                drain(serve, &self.shutdown, self.graceful_timeout).await
            }
            ListenAddress::Unix { path, mode, user, group } => {
                let listener = bind_unix(path, *mode, user.as_deref(), group.as_deref())?;
                info!(
                    target: "facette::server",
                    socket = %path.display(),
                    base_path = %self.state.config.http.base_path,
                    version = VERSION,
                    "Listening"
                );
                let serve = axum::serve(listener, app)
                    .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
                    .into_future();
                let result = drain(serve, &self.shutdown, self.graceful_timeout).await;
                if let Err(e) = fs::remove_file(path) {
                    debug!(target: "facette::server", socket = %path.display(), error = %e, "Socket already removed");
                }
                result
            }
        }
    }
}

/// Run the server future until it returns. Once `shutdown` fires, in-flight
/// requests get at most `grace` to complete.
async fn drain<F>(serve: F, shutdown: &CancellationToken, grace: Duration) -> FacetteResult<()>
where
    F: Future<Output = io::Result<()>> + Send + 'static,
{
    let mut handle = tokio::spawn(serve);

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = shutdown.cancelled() => {
            info!(
                target: "facette::server",
                grace = %humantime::format_duration(grace),
                "Draining HTTP connections"
            );
            match timeout(grace, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(target: "facette::server", "Graceful timeout elapsed, closing remaining connections");
                    handle.abort();
                    return Ok(());
                }
            }
        }
    };

    match joined {
        Ok(result) => result.map_err(FacetteError::Io),
        Err(e) => Err(FacetteError::Internal(format!("HTTP server task failed: {}", e))),
    }
}

// ----------------------------------------------------------------------------
// Unix socket listener
// ----------------------------------------------------------------------------

/// Bind `path`, replacing a stale socket, then apply mode and ownership.
fn bind_unix(
    path: &Path,
    mode: Option<u32>,
    user: Option<&str>,
    group: Option<&str>,
) -> FacetteResult<UnixListener> {
    if path.exists() {
        debug!(target: "facette::server", socket = %path.display(), "Removing stale socket");
        fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;

    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }

    if user.is_some() || group.is_some() {
        let uid = user
            .map(|name| match User::from_name(name).map_err(io::Error::from)? {
                Some(user) => Ok(user.uid),
                None => Err(unknown_owner("user", name)),
            })
            .transpose()?;
        let gid = group
            .map(|name| match Group::from_name(name).map_err(io::Error::from)? {
                Some(group) => Ok(group.gid),
                None => Err(unknown_owner("group", name)),
            })
            .transpose()?;
        chown(path, uid, gid).map_err(io::Error::from)?;
    }

    Ok(listener)
}

fn unknown_owner(kind: &str, name: &str) -> FacetteError {
    ConfigError::invalid_value("http.listen", format!("unknown {} '{}'", kind, name)).into()
}

// ----------------------------------------------------------------------------
// Signals
// ----------------------------------------------------------------------------

async fn handle_signals(shutdown: CancellationToken, poller: Arc<Poller>) {
    if let Err(e) = wait_signals(&shutdown, &poller).await {
        error!(target: "facette::server", error = %e, "Unable to install signal handlers");
    }
    shutdown.cancel();
}

async fn wait_signals(shutdown: &CancellationToken, poller: &Poller) -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(target: "facette::server", "Received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!(target: "facette::server", "Received SIGINT");
                return Ok(());
            }
            _ = sigquit.recv() => {
                info!(target: "facette::server", "Received SIGQUIT");
                return Ok(());
            }
            _ = sigusr1.recv() => {
                info!(target: "facette::server", "Received SIGUSR1, refreshing providers");
                poller.refresh_all();
            }
            _ = sighup.recv() => {
                info!(target: "facette::server", "Received SIGHUP, ignored");
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

/// Router of a standalone server, for embedding.
pub fn app(server: &Server) -> Router {
    router(server.state.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Item, Provider};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    fn config(listen: &str) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.http.listen = listen.into();
        config.http.graceful_timeout = 1;
        config
    }

    #[test]
    fn test_instance_id() {
        let mut cfg = config("127.0.0.1:0");
        cfg.instance_id = Some("gateway-1".into());
        let server = tokio_test::assert_ok!(Server::new(cfg));
        assert_eq!(&*server.state().instance_id, "gateway-1");

        let generated = Server::new(config("127.0.0.1:0")).unwrap();
        assert!(uuid::Uuid::parse_str(&generated.state().instance_id).is_ok());
    }

    #[test]
    fn test_invalid_listen() {
        let result = Server::new(config("nowhere"));
        assert!(matches!(result, Err(FacetteError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_providers_skips_broken() {
        let server = Server::new(config("127.0.0.1:0")).unwrap();
        server
            .state()
            .store
            .save(Provider {
                item: Item::named("broken"),
                connector: "graphite".into(),
                ..Default::default()
            })
            .unwrap();
        server
            .state()
            .store
            .save(Provider {
                item: Item::named("off"),
                connector: "graphite".into(),
                enabled: false,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(server.start_providers().await, 0);
        assert_eq!(server.state().poller.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_app_router() {
        let server = Server::new(config("127.0.0.1:0")).unwrap();
        let response = app(&server)
            .oneshot(Request::get("/api/v1/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unix_socket_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facette.sock");
        // A leftover file at the socket path gets replaced
        fs::write(&path, b"stale").unwrap();

        let server = Server::new(config(&format!("unix:{}?mode=0600", path.display()))).unwrap();
        let token = server.shutdown_token();
        let running = tokio::spawn(server.run());

        let deadline = Instant::now() + Duration::from_secs(5);
        while tokio::net::UnixStream::connect(&path).await.is_err() {
            assert!(Instant::now() < deadline, "socket never came up");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        token.cancel();
        running.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_tcp_shutdown() {
        let server = Server::new(config("127.0.0.1:0")).unwrap();
        let token = server.shutdown_token();
        let running = tokio::spawn(server.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
