//! HLS publication: playlist ownership, housekeeping and the HTTPS
//! surface.
//!
//! The publisher is the sole mutator of the segment list. Segment
//! metadata arrives over the media-control channel; a five-second
//! housekeeping tick ages segments out of the playlist and eventually
//! off the disk. The playlist file is rewritten atomically under a
//! mutex shared with the `.m3u8` request handler, so readers never see
//! a torn playlist.

use anyhow::{Context, Result};
use chrono::Utc;
use chuff_common::MetricsContext;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{header, Body, Method, Request, Response, StatusCode};
use std::fs::File;
use std::io::{self, BufReader};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::Receiver;
use tokio::sync::Mutex;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::playlist::{SegmentList, PLAYLIST_EXTENSION};
use crate::segment::{MediaControl, SEGMENT_EXTENSION};

/// TLS certificate and key, expected in the working directory.
const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "privkey.pem";

/// How often segment ageing runs.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    // ---
    /// HTTPS port to serve on
    pub port: u16,

    /// Path of the playlist file; segments live in its directory
    pub playlist_path: PathBuf,

    /// Directory to redirect to while no live audio is available
    pub out_of_service_dir: Option<String>,
}

/// State shared between the publisher task and the request handlers.
struct ServeState {
    // ---
    playlist_path: PathBuf,
    segment_dir: PathBuf,

    /// Held across every playlist write and every `.m3u8` serve
    playlist_lock: Mutex<()>,

    /// Redirect target for `/` while live
    live_location: String,

    /// Redirect target for `/` while out of service
    oos_location: Option<String>,

    /// Whether no live audio is currently being produced
    out_of_service: AtomicBool,
}

/// Owns the segment list and the playlist file.
pub struct Publisher {
    // ---
    state: Arc<ServeState>,
    list: SegmentList,
    port: u16,
    metrics: MetricsContext,
}

impl Publisher {
    // ---
    /// Creates the publisher and writes the initial (empty) playlist.
    ///
    /// # Errors
    ///
    /// Returns error if the playlist file cannot be created; callers
    /// treat this as fatal at startup.
    pub fn new(cfg: PublisherConfig, metrics: MetricsContext) -> Result<Self> {
        // ---
        let segment_dir = crate::segment::segment_dir(&cfg.playlist_path);

        let state = Arc::new(ServeState {
            playlist_path: cfg.playlist_path.clone(),
            live_location: location_for(&segment_dir),
            oos_location: cfg.out_of_service_dir.map(|dir| location_for(Path::new(&dir))),
            segment_dir,
            playlist_lock: Mutex::new(()),
            out_of_service: AtomicBool::new(true),
        });

        let publisher = Self {
            state,
            list: SegmentList::new(),
            port: cfg.port,
            metrics,
        };

        publisher
            .write_playlist()
            .context("failed to create the playlist file")?;

        Ok(publisher)
    }

    /// Runs the publisher until the media-control channel closes.
    ///
    /// # Errors
    ///
    /// Returns error if TLS material cannot be loaded or the HTTPS
    /// listener cannot be bound.
    pub async fn run(mut self, mut media: Receiver<MediaControl>) -> Result<()> {
        // ---
        let tls = load_tls_config(Path::new(CERT_FILE), Path::new(KEY_FILE))?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        info!("starting HTTPS server for Chuff requests on port {}", self.port);

        let mut server = tokio::spawn(serve_https(addr, tls, Arc::clone(&self.state)));
        let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);

        loop {
            tokio::select! {
                joined = &mut server => {
                    return joined.context("HTTPS server task panicked")?;
                }
                message = media.recv() => match message {
                    Some(MediaControl::SegmentPublished(meta)) => {
                        self.list.push(meta);
                        self.state.out_of_service.store(false, Ordering::Relaxed);
                        self.rebuild_playlist().await;
                    }
                    None => break,
                },
                _ = tick.tick() => self.housekeep().await,
            }
        }

        self.clear_segment_files();
        info!("media control channel closed, publisher stopping");
        Ok(())
    }

    /// One housekeeping pass: demote aged segments, delete removable
    /// files, refresh the out-of-service switch.
    async fn housekeep(&mut self) {
        // ---
        let now = Utc::now();
        let outcome = self.list.age(now);
        self.metrics.segments_retired_total.inc_by(outcome.retired);

        if outcome.playlist_changed {
            self.rebuild_playlist().await;
        }

        for file_name in outcome.removable {
            let path = self.state.segment_dir.join(&file_name);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("MP3 file \"{}\" deleted", path.display());
                    self.metrics.segments_removed_total.inc();
                    self.list.mark_removed(&file_name);
                }
                // Deletion is idempotent: a file already gone is done.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.list.mark_removed(&file_name);
                }
                Err(e) => warn!("unable to delete \"{}\": {}", path.display(), e),
            }
        }

        if self.list.is_quiet(now) {
            self.state.out_of_service.store(true, Ordering::Relaxed);
        }
    }

    /// Rewrites the playlist; on failure the stale file stays in place
    /// and the next publish or tick retries.
    async fn rebuild_playlist(&self) {
        // ---
        let _guard = self.state.playlist_lock.lock().await;
        if let Err(e) = self.write_playlist() {
            warn!("unable to update playlist: {:#}", e);
            return;
        }
        self.metrics.playlist_rebuilds_total.inc();
        debug!(
            "updated playlist \"{}\" with {} segment(s)",
            self.state.playlist_path.display(),
            self.list.usable_segments().count()
        );
    }

    /// Renders and atomically replaces the playlist file.
    fn write_playlist(&self) -> Result<()> {
        // ---
        let text = self.list.render();
        let temp = self.state.playlist_path.with_extension("tmp");

        std::fs::write(&temp, text)
            .with_context(|| format!("failed to write {}", temp.display()))?;
        std::fs::rename(&temp, &self.state.playlist_path).with_context(|| {
            format!("failed to replace {}", self.state.playlist_path.display())
        })?;

        Ok(())
    }

    /// Best-effort removal of every segment file still on record.
    fn clear_segment_files(&mut self) {
        // ---
        for file_name in self.list.file_names() {
            let path = self.state.segment_dir.join(&file_name);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("unable to delete \"{}\": {}", path.display(), e);
                }
            }
            self.list.mark_removed(&file_name);
        }
    }
}

/// Deletes pre-existing segment files from the playlist directory, for
/// the `-c` startup option.
///
/// # Errors
///
/// Returns error if the directory cannot be read.
pub fn clear_stale_segments(playlist_path: &Path) -> Result<usize> {
    // ---
    let dir = crate::segment::segment_dir(playlist_path);

    let mut removed = 0;
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("failed to read segment directory {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("unable to delete \"{}\": {}", path.display(), e),
            }
        }
    }

    if removed > 0 {
        info!("cleared {} stale segment file(s)", removed);
    }
    Ok(removed)
}

/// URL path a directory is served under.
fn location_for(dir: &Path) -> String {
    // ---
    let trimmed = dir
        .to_string_lossy()
        .trim_start_matches("./")
        .trim_matches('/')
        .to_string();

    if trimmed.is_empty() || trimmed == "." {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

/// Loads the TLS certificate chain and private key.
fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    // ---
    let mut cert_reader = BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("failed to open {}", cert_path.display()))?,
    );
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut cert_reader)
        .context("failed to parse the TLS certificate")?
        .into_iter()
        .map(Certificate)
        .collect();

    let mut key_reader = BufReader::new(
        File::open(key_path).with_context(|| format!("failed to open {}", key_path.display()))?,
    );
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .context("failed to parse the TLS private key")?;
    if keys.is_empty() {
        // Fall back to a PKCS#1 (RSA) key file.
        let mut key_reader = BufReader::new(File::open(key_path)?);
        keys = rustls_pemfile::rsa_private_keys(&mut key_reader)
            .context("failed to parse the TLS private key")?;
    }
    let key = keys
        .into_iter()
        .next()
        .map(PrivateKey)
        .with_context(|| format!("no private key found in {}", key_path.display()))?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS certificate and key do not form a valid identity")?;

    Ok(Arc::new(config))
}

/// Accepts TLS connections and serves HTTP over them, forever.
async fn serve_https(
    addr: SocketAddr,
    tls: Arc<ServerConfig>,
    state: Arc<ServeState>,
) -> Result<()> {
    // ---
    let acceptor = TlsAcceptor::from(tls);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTPS listener to {}", addr))?;

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("error accepting HTTPS connection: {}", e);
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(req, state).await }
                    });
                    if let Err(e) = Http::new().serve_connection(tls_stream, service).await {
                        debug!("connection from {} ended: {}", peer, e);
                    }
                }
                Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
            }
        });
    }
}

/// Routes one request.
async fn handle_request(
    req: Request<Body>,
    state: Arc<ServeState>,
) -> Result<Response<Body>, hyper::Error> {
    // ---
    // Cross-domain browsing preflight is allowed, not served.
    if req.method() == Method::OPTIONS {
        debug!("received OPTIONS request for {}, allowing it", req.uri());
        let mut resp = Response::new(Body::empty());
        add_cross_domain(&mut resp);
        add_preflight(&mut resp);
        return Ok(resp);
    }

    let path = req.uri().path().to_string();
    let extension = Path::new(&path)
        .extension()
        .map(|ext| ext.to_string_lossy().to_string());

    let mut resp = match extension.as_deref() {
        Some(PLAYLIST_EXTENSION) => serve_playlist(&state).await,
        Some(SEGMENT_EXTENSION) => serve_segment(&state, &path).await,
        _ if path == "/" => redirect_home(&state),
        _ => serve_static(&path).await,
    };

    add_cross_domain(&mut resp);
    Ok(resp)
}

/// Serves the playlist file under the shared mutex.
async fn serve_playlist(state: &ServeState) -> Response<Body> {
    // ---
    let guard = state.playlist_lock.lock().await;
    let contents = tokio::fs::read(&state.playlist_path).await;
    drop(guard);

    match contents {
        Ok(bytes) => {
            debug!("serving playlist \"{}\"", state.playlist_path.display());
            let mut resp = Response::new(Body::from(bytes));
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/x-mpegurl"),
            );
            no_cache(&mut resp);
            resp
        }
        Err(e) => {
            warn!(
                "unable to read playlist \"{}\": {}",
                state.playlist_path.display(),
                e
            );
            not_found()
        }
    }
}

/// Serves a segment file from the playlist directory.
async fn serve_segment(state: &ServeState, path: &str) -> Response<Body> {
    // ---
    let Some(file_name) = Path::new(path).file_name() else {
        return not_found();
    };

    match tokio::fs::read(state.segment_dir.join(file_name)).await {
        Ok(bytes) => {
            debug!("serving segment \"{}\"", file_name.to_string_lossy());
            let mut resp = Response::new(Body::from(bytes));
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("audio/mpeg"),
            );
            no_cache(&mut resp);
            resp
        }
        Err(_) => not_found(),
    }
}

/// Redirects `/` to the live stream, or to the out-of-service page
/// while no audio is being produced.
fn redirect_home(state: &ServeState) -> Response<Body> {
    // ---
    let location = if state.out_of_service.load(Ordering::Relaxed) {
        state
            .oos_location
            .as_deref()
            .unwrap_or(&state.live_location)
    } else {
        &state.live_location
    };

    debug!("redirecting \"/\" to \"{}\"", location);

    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::FOUND;
    match header::HeaderValue::from_str(location) {
        Ok(value) => {
            resp.headers_mut().insert(header::LOCATION, value);
        }
        Err(_) => *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR,
    }
    resp
}

/// Serves any other path as a static file relative to the working
/// directory.
async fn serve_static(path: &str) -> Response<Body> {
    // ---
    let relative = Path::new(path.trim_start_matches('/'));

    // Confine static serving below the working directory.
    let traversal = relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)));
    if traversal || relative.as_os_str().is_empty() {
        return not_found();
    }

    match tokio::fs::read(relative).await {
        Ok(bytes) => {
            debug!("serving \"{}\"", relative.display());
            let mut resp = Response::new(Body::from(bytes));
            no_cache(&mut resp);
            resp
        }
        Err(_) => not_found(),
    }
}

/// Cross-domain response items; the allowances a browser needs to play
/// the stream from another origin.
fn add_cross_domain(resp: &mut Response<Body>) {
    // ---
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        header::HeaderValue::from_static("Content-Type, X-Requested-With"),
    );
}

fn add_preflight(resp: &mut Response<Body>) {
    // ---
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        header::HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        header::HeaderValue::from_static("86400"),
    );
}

fn no_cache(resp: &mut Response<Body>) {
    // ---
    resp.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
}

fn not_found() -> Response<Body> {
    // ---
    let mut resp = Response::new(Body::from("not found"));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_location_for_directories() {
        // ---
        assert_eq!(location_for(Path::new("stream")), "/stream/");
        assert_eq!(location_for(Path::new("./stream")), "/stream/");
        assert_eq!(location_for(Path::new(".")), "/");
        assert_eq!(location_for(Path::new("")), "/");
    }

    #[tokio::test]
    async fn test_static_serving_rejects_traversal() {
        // ---
        let resp = serve_static("/../etc/passwd").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_options_preflight_is_allowed() {
        // ---
        let state = Arc::new(ServeState {
            playlist_path: PathBuf::from("stream/live.m3u8"),
            segment_dir: PathBuf::from("stream"),
            playlist_lock: Mutex::new(()),
            live_location: "/stream/".to_string(),
            oos_location: None,
            out_of_service: AtomicBool::new(false),
        });

        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("https://example/live.m3u8")
            .body(Body::empty())
            .expect("request build failed");

        let resp = handle_request(req, state).await.expect("handler failed");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .expect("missing allow-origin"),
            "*"
        );
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_MAX_AGE)
                .expect("missing max-age"),
            "86400"
        );
    }

    #[tokio::test]
    async fn test_home_redirects_to_oos_when_quiet() {
        // ---
        let state = Arc::new(ServeState {
            playlist_path: PathBuf::from("stream/live.m3u8"),
            segment_dir: PathBuf::from("stream"),
            playlist_lock: Mutex::new(()),
            live_location: "/stream/".to_string(),
            oos_location: Some("/offair/".to_string()),
            out_of_service: AtomicBool::new(true),
        });

        let req = Request::builder()
            .uri("https://example/")
            .body(Body::empty())
            .expect("request build failed");

        let resp = handle_request(req, Arc::clone(&state))
            .await
            .expect("handler failed");
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).expect("no location"),
            "/offair/"
        );

        state.out_of_service.store(false, Ordering::Relaxed);
        let req = Request::builder()
            .uri("https://example/")
            .body(Body::empty())
            .expect("request build failed");
        let resp = handle_request(req, state).await.expect("handler failed");
        assert_eq!(
            resp.headers().get(header::LOCATION).expect("no location"),
            "/stream/"
        );
    }
}
