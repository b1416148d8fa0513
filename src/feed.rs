use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::progress::ProgressSink;

/// Name of the managed artifact, without platform suffixes.
pub const ARTIFACT_NAME: &str = "packwiz-installer";

/// Read inactivity limit applied to every network operation.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a blocked network call looks at the cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(100);

const CHUNK_SIZE: usize = 64 * 1024;

pub const GITHUB_API: &str = "https://api.github.com";

/// Release asset name for the platform this launcher was built for,
/// e.g. `packwiz-installer-x86_64-linux` or `packwiz-installer-x86_64-windows.exe`.
pub fn asset_name() -> String {
    format!(
        "{}-{}-{}{}",
        ARTIFACT_NAME,
        std::env::consts::ARCH,
        std::env::consts::OS,
        std::env::consts::EXE_SUFFIX
    )
}

/// "Latest release" endpoint for a repository reference.
pub fn repo_release_url(api: &str, user: &str, repo: &str) -> String {
    format!("{api}/repos/{user}/{repo}/releases/latest")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub tag:          String,
    pub download_url: String, // browser_download_url
    pub asset_url:    String, // API metadata endpoint, used for authenticated downloads
}

/// Outcome of an operation the user is allowed to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch<T> {
    Ready(T),
    Cancelled,
}

/// Shared flag raised by a user-initiated abort (Ctrl+C).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("release feed {url} is unreachable")]
    Unreachable {
        url:    String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("invalid release feed response: {0}")]
    Format(String),
}

fn feed_unreachable(url: &str, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> FeedError {
    FeedError::Unreachable {
        url:    url.to_string(),
        source: source.into(),
    }
}

/// Network side of the launcher. Everything that talks to the release host goes
/// through this trait so the update and launch logic can run against a fake.
pub trait ReleaseFeed {
    /// Fetch and validate the latest release from `feed_url`.
    fn fetch_latest(&self, feed_url: &str, token: Option<&str>)
        -> Result<Fetch<ReleaseInfo>, FeedError>;

    /// Stream the release's artifact into `out`, returning the byte count.
    fn download(
        &self,
        release: &ReleaseInfo,
        token: Option<&str>,
        out: &mut dyn Write,
    ) -> io::Result<Fetch<u64>>;

    /// Latest release tag of `user/repo`.
    fn latest_tag(&self, user: &str, repo: &str) -> Result<Fetch<String>, FeedError>;
}

/// Parse a release feed body and pick the asset called `asset_name`.
///
/// Every asset up to the match must be an object with a string `name`; the
/// first case-insensitive match wins.
pub fn parse_release(body: &[u8], asset_name: &str) -> Result<ReleaseInfo, FeedError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| FeedError::Format(format!("response is not valid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| FeedError::Format("response is not a JSON object".to_string()))?;

    let tag = string_field(object, "tag_name", "Tag name")?;

    let assets = object
        .get("assets")
        .and_then(Value::as_array)
        .ok_or_else(|| FeedError::Format("assets array cannot be found".to_string()))?;

    for entry in assets {
        let asset = entry
            .as_object()
            .ok_or_else(|| FeedError::Format("asset entry is not an object".to_string()))?;
        let name = string_field(asset, "name", "Asset name")?;
        if !name.eq_ignore_ascii_case(asset_name) {
            continue;
        }
        return Ok(ReleaseInfo {
            tag:          tag.to_string(),
            download_url: string_field(asset, "browser_download_url", "Asset download URL")?
                .to_string(),
            asset_url:    string_field(asset, "url", "Asset metadata URL")?.to_string(),
        });
    }

    Err(FeedError::Format(format!(
        "release {tag} has no asset named {asset_name}"
    )))
}

fn string_field<'v>(
    object: &'v Map<String, Value>,
    field: &str,
    display: &str,
) -> Result<&'v str, FeedError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::Format(format!("{display} ({field}) cannot be found")))
}

/// Copy `reader` into `out` chunk by chunk, stopping early once `cancel` is raised.
pub fn copy_cancellable(
    reader: &mut dyn Read,
    out: &mut dyn Write,
    cancel: &CancelToken,
    sink: &dyn ProgressSink,
) -> io::Result<Fetch<u64>> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Ok(Fetch::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // A read aborted by the user surfaces as a timeout or reset.
            Err(_) if cancel.is_cancelled() => return Ok(Fetch::Cancelled),
            Err(e) => return Err(e),
        };
        out.write_all(&buf[..n])?;
        copied += n as u64;
        sink.advance(n as u64);
    }
    out.flush()?;
    Ok(Fetch::Ready(copied))
}

/// Run `work` on a worker thread and wait for it, giving up as soon as
/// `cancel` is raised. An abandoned worker exits once its blocking call returns.
fn interruptible<T, F>(cancel: &CancelToken, work: F) -> io::Result<Fetch<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::spawn(move || {
        let _ = tx.send(work());
    });
    loop {
        match rx.recv_timeout(CANCEL_POLL) {
            Ok(value) => return Ok(Fetch::Ready(value)),
            Err(RecvTimeoutError::Timeout) if cancel.is_cancelled() => return Ok(Fetch::Cancelled),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(io::Error::other("network worker stopped unexpectedly"))
            }
        }
    }
}

/// A response body read on a worker thread. While no data has arrived, each
/// read returns `Interrupted` after one poll interval so that
/// [`copy_cancellable`] gets to look at the cancel flag.
struct BackgroundBody {
    chunks:  Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    offset:  usize,
    done:    bool,
}

impl BackgroundBody {
    fn spawn(mut body: impl Read + Send + 'static) -> Self {
        let (tx, rx) = mpsc::sync_channel(4);
        thread::spawn(move || {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let chunk = match body.read(&mut buf) {
                    Ok(n) => Ok(buf[..n].to_vec()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                // An empty chunk marks the end of the body.
                let last = chunk.as_ref().map_or(true, Vec::is_empty);
                if tx.send(chunk).is_err() || last {
                    break;
                }
            }
        });
        Self {
            chunks:  rx,
            pending: Vec::new(),
            offset:  0,
            done:    false,
        }
    }
}

impl Read for BackgroundBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done {
            return Ok(0);
        }
        if self.offset == self.pending.len() {
            match self.chunks.recv_timeout(CANCEL_POLL) {
                Ok(chunk) => {
                    self.pending = chunk?;
                    self.offset = 0;
                    if self.pending.is_empty() {
                        self.done = true;
                        return Ok(0);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::Interrupted.into()),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::other("body reader stopped before the end of the response"))
                }
            }
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

#[derive(Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// `ReleaseFeed` over HTTPS with a blocking client. Every blocking call runs
/// on a worker thread so Ctrl+C takes effect within one poll interval.
pub struct HttpFeed<'a> {
    client: Client,
    api:    String,
    sink:   &'a dyn ProgressSink,
    cancel: CancelToken,
}

impl<'a> HttpFeed<'a> {
    pub fn new(sink: &'a dyn ProgressSink, cancel: CancelToken) -> reqwest::Result<Self> {
        // The blocking client applies this limit to each read of the body,
        // so a slow but live download is not cut off.
        let client = Client::builder()
            .user_agent(format!("packwiz-installer-bootstrap/{}", env!("CARGO_PKG_VERSION")))
            .timeout(READ_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api: GITHUB_API.to_string(),
            sink,
            cancel,
        })
    }

    #[cfg(test)]
    fn with_api(mut self, api: &str) -> Self {
        self.api = api.to_string();
        self
    }

    fn request(&self, url: &str, token: Option<&str>) -> RequestBuilder {
        let request = self.client.get(url);
        match token {
            Some(token) => request.header(AUTHORIZATION, token),
            None => request,
        }
    }

    /// Send `request`, treating a non-success status as an error.
    fn send(&self, request: RequestBuilder) -> io::Result<Fetch<Response>> {
        let sent = interruptible(&self.cancel, move || {
            request
                .send()
                .and_then(Response::error_for_status)
                .map_err(io::Error::other)
        })?;
        match sent {
            Fetch::Ready(Err(_)) if self.cancel.is_cancelled() => Ok(Fetch::Cancelled),
            Fetch::Ready(result) => result.map(Fetch::Ready),
            Fetch::Cancelled => Ok(Fetch::Cancelled),
        }
    }

    /// Stream the body of `response` into `out` with progress reporting.
    fn receive(
        &self,
        message: &str,
        response: Response,
        out: &mut dyn Write,
    ) -> io::Result<Fetch<u64>> {
        self.sink.start(message, response.content_length());
        let mut body = BackgroundBody::spawn(response);
        let copied = copy_cancellable(&mut body, out, &self.cancel, self.sink);
        self.sink.finish();
        copied
    }

    /// GET `url` and collect the whole body.
    fn get_body(
        &self,
        url: &str,
        request: RequestBuilder,
        message: &str,
    ) -> Result<Fetch<Vec<u8>>, FeedError> {
        let response = match self.send(request).map_err(|e| feed_unreachable(url, e))? {
            Fetch::Ready(response) => response,
            Fetch::Cancelled => return Ok(Fetch::Cancelled),
        };
        let mut body = Vec::new();
        match self
            .receive(message, response, &mut body)
            .map_err(|e| feed_unreachable(url, e))?
        {
            Fetch::Ready(_) => Ok(Fetch::Ready(body)),
            Fetch::Cancelled => Ok(Fetch::Cancelled),
        }
    }
}

impl ReleaseFeed for HttpFeed<'_> {
    fn fetch_latest(
        &self,
        feed_url: &str,
        token: Option<&str>,
    ) -> Result<Fetch<ReleaseInfo>, FeedError> {
        debug!(feed_url, authenticated = token.is_some(), "requesting release feed");
        let request = self.request(feed_url, token);
        match self.get_body(feed_url, request, "Checking for packwiz-installer updates...")? {
            Fetch::Ready(body) => parse_release(&body, &asset_name()).map(Fetch::Ready),
            Fetch::Cancelled => {
                info!("update check cancelled");
                Ok(Fetch::Cancelled)
            }
        }
    }

    fn download(
        &self,
        release: &ReleaseInfo,
        token: Option<&str>,
        out: &mut dyn Write,
    ) -> io::Result<Fetch<u64>> {
        // Private repositories only serve assets through the API endpoint.
        let url = match token {
            Some(_) => &release.asset_url,
            None => &release.download_url,
        };
        debug!(url = %url, tag = %release.tag, "downloading artifact");
        let request = self.request(url, token).header(ACCEPT, "application/octet-stream");
        match self.send(request)? {
            Fetch::Ready(response) => self.receive(
                &format!("Updating packwiz-installer to {}...", release.tag),
                response,
                out,
            ),
            Fetch::Cancelled => Ok(Fetch::Cancelled),
        }
    }

    fn latest_tag(&self, user: &str, repo: &str) -> Result<Fetch<String>, FeedError> {
        let url = repo_release_url(&self.api, user, repo);
        let request = self.client.get(&url).header(ACCEPT, "application/vnd.github+json");
        let message = format!("Looking up the latest release of {user}/{repo}...");
        let body = match self.get_body(&url, request, &message)? {
            Fetch::Ready(body) => body,
            Fetch::Cancelled => {
                info!(%user, %repo, "release lookup cancelled");
                return Ok(Fetch::Cancelled);
            }
        };
        let release: LatestRelease = serde_json::from_slice(&body)
            .map_err(|e| FeedError::Format(format!("tag_name cannot be found: {e}")))?;
        Ok(Fetch::Ready(release.tag_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use std::time::Instant;

    const NAME: &str = "packwiz-installer-x86_64-linux";

    fn feed_body(assets: &str) -> Vec<u8> {
        format!(r#"{{"tag_name": "v1.4.0", "assets": {assets}}}"#).into_bytes()
    }

    #[test]
    fn parse_release_picks_matching_asset() {
        let body = feed_body(
            r#"[
                {"name": "other.zip", "browser_download_url": "https://dl/other", "url": "https://api/other"},
                {"name": "PACKWIZ-INSTALLER-x86_64-linux", "browser_download_url": "https://dl/pw", "url": "https://api/pw"},
                {"name": "packwiz-installer-x86_64-linux", "browser_download_url": "https://dl/second", "url": "https://api/second"}
            ]"#,
        );
        let release = parse_release(&body, NAME).unwrap();
        assert_eq!(
            release,
            ReleaseInfo {
                tag:          "v1.4.0".to_string(),
                download_url: "https://dl/pw".to_string(),
                asset_url:    "https://api/pw".to_string(),
            }
        );
    }

    #[test]
    fn parse_release_requires_string_tag() {
        let body = br#"{"tag_name": 14, "assets": []}"#;
        let err = parse_release(body, NAME).unwrap_err();
        assert!(matches!(err, FeedError::Format(ref m) if m.contains("tag_name")), "{err}");
    }

    #[test]
    fn parse_release_requires_assets_array() {
        let err = parse_release(br#"{"tag_name": "v1"}"#, NAME).unwrap_err();
        assert!(matches!(err, FeedError::Format(ref m) if m.contains("assets")), "{err}");

        let err = parse_release(br#"{"tag_name": "v1", "assets": {}}"#, NAME).unwrap_err();
        assert!(matches!(err, FeedError::Format(_)));
    }

    #[test]
    fn parse_release_rejects_non_object_asset() {
        let err = parse_release(&feed_body(r#"["packwiz-installer"]"#), NAME).unwrap_err();
        assert!(matches!(err, FeedError::Format(ref m) if m.contains("not an object")));
    }

    #[test]
    fn parse_release_rejects_asset_without_name() {
        let err = parse_release(&feed_body(r#"[{"url": "https://api/x"}]"#), NAME).unwrap_err();
        assert!(matches!(err, FeedError::Format(ref m) if m.contains("(name)")));
    }

    #[test]
    fn parse_release_reports_missing_asset() {
        let body = feed_body(r#"[{"name": "readme.txt", "browser_download_url": "a", "url": "b"}]"#);
        let err = parse_release(&body, NAME).unwrap_err();
        assert!(err.to_string().contains(NAME));
    }

    #[test]
    fn parse_release_rejects_garbage() {
        assert!(matches!(
            parse_release(b"<html>rate limited</html>", NAME),
            Err(FeedError::Format(_))
        ));
        assert!(matches!(parse_release(b"[]", NAME), Err(FeedError::Format(_))));
    }

    #[test]
    fn copy_cancellable_copies_everything() {
        let sink = RecordingSink::default();
        let data = vec![7u8; CHUNK_SIZE * 2 + 13];
        let mut out = Vec::new();
        let result = copy_cancellable(&mut data.as_slice(), &mut out, &CancelToken::new(), &sink);
        assert_eq!(result.unwrap(), Fetch::Ready(data.len() as u64));
        assert_eq!(out, data);
        assert_eq!(sink.advanced.get(), data.len() as u64);
    }

    #[test]
    fn copy_cancellable_stops_when_cancelled() {
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        let result = copy_cancellable(&mut &b"payload"[..], &mut out, &cancel, &sink);
        assert_eq!(result.unwrap(), Fetch::Cancelled);
        assert!(out.is_empty());
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let handle = token.clone();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn asset_name_carries_platform() {
        let name = asset_name();
        assert!(name.starts_with("packwiz-installer-"));
        assert!(name.contains(std::env::consts::ARCH));
        assert!(name.contains(std::env::consts::OS));
    }

    #[test]
    fn repo_release_url_template() {
        assert_eq!(
            repo_release_url(GITHUB_API, "acme", "pack"),
            "https://api.github.com/repos/acme/pack/releases/latest"
        );
    }

    /// Raises the cancel flag from inside a read that then fails, the way a
    /// stalled socket times out after Ctrl+C.
    struct CancelDuringRead(CancelToken);

    impl Read for CancelDuringRead {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            self.0.cancel();
            Err(io::ErrorKind::TimedOut.into())
        }
    }

    #[test]
    fn failed_read_after_cancel_is_a_cancellation() {
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        let mut reader = CancelDuringRead(cancel.clone());
        let result = copy_cancellable(&mut reader, &mut Vec::new(), &cancel, &sink);
        assert_eq!(result.unwrap(), Fetch::Cancelled);
    }

    #[test]
    fn failed_read_without_cancel_is_an_error() {
        struct Reset;
        impl Read for Reset {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
        }
        let sink = RecordingSink::default();
        let err = copy_cancellable(&mut Reset, &mut Vec::new(), &CancelToken::new(), &sink).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn background_body_delivers_everything() {
        let sink = RecordingSink::default();
        let data: Vec<u8> = (0..CHUNK_SIZE * 3 + 7).map(|i| i as u8).collect();
        let mut body = BackgroundBody::spawn(io::Cursor::new(data.clone()));
        let mut out = Vec::new();
        let result = copy_cancellable(&mut body, &mut out, &CancelToken::new(), &sink);
        assert_eq!(result.unwrap(), Fetch::Ready(data.len() as u64));
        assert_eq!(out, data);
    }

    #[test]
    fn stalled_body_is_abandoned_on_cancel() {
        struct Stalled;
        impl Read for Stalled {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                thread::sleep(Duration::from_secs(3));
                Ok(0)
            }
        }
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });

        let started = Instant::now();
        let mut body = BackgroundBody::spawn(Stalled);
        let result = copy_cancellable(&mut body, &mut Vec::new(), &cancel, &sink);
        assert_eq!(result.unwrap(), Fetch::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    struct Seen {
        url:           String,
        authorization: Option<String>,
        accept:        Option<String>,
    }

    /// Local server answering one request per reply, in order. `replies` gets
    /// the server's base URL. Joining the handle yields what each request carried.
    fn serve(
        replies: impl FnOnce(&str) -> Vec<(u16, Vec<u8>)>,
    ) -> (String, thread::JoinHandle<Vec<Seen>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}", server.server_addr().to_ip().unwrap());
        let replies = replies(&base);
        let handle = thread::spawn(move || {
            replies
                .into_iter()
                .map(|(status, body)| {
                    let request = server.recv().unwrap();
                    let header = |name: &'static str| {
                        request
                            .headers()
                            .iter()
                            .find(|h| h.field.equiv(name))
                            .map(|h| h.value.as_str().to_string())
                    };
                    let seen = Seen {
                        url:           request.url().to_string(),
                        authorization: header("Authorization"),
                        accept:        header("Accept"),
                    };
                    let response = tiny_http::Response::from_data(body)
                        .with_status_code(tiny_http::StatusCode(status));
                    request.respond(response).unwrap();
                    seen
                })
                .collect()
        });
        (base, handle)
    }

    fn release_json(base: &str) -> Vec<u8> {
        format!(
            r#"{{"tag_name": "v2.0.0", "assets": [{{"name": "{}", "browser_download_url": "{base}/download", "url": "{base}/asset"}}]}}"#,
            asset_name()
        )
        .into_bytes()
    }

    #[test]
    fn http_feed_sends_authorization_only_with_token() {
        let (base, server) = serve(|base| vec![(200, release_json(base)), (200, release_json(base))]);
        let sink = RecordingSink::default();
        let feed = HttpFeed::new(&sink, CancelToken::new()).unwrap();
        let feed_url = format!("{base}/releases/latest");

        let anonymous = feed.fetch_latest(&feed_url, None).unwrap();
        let authenticated = feed.fetch_latest(&feed_url, Some("token abc")).unwrap();

        let expected = ReleaseInfo {
            tag:          "v2.0.0".to_string(),
            download_url: format!("{base}/download"),
            asset_url:    format!("{base}/asset"),
        };
        assert_eq!(anonymous, Fetch::Ready(expected.clone()));
        assert_eq!(authenticated, Fetch::Ready(expected));

        let seen = server.join().unwrap();
        assert_eq!(seen[0].url, "/releases/latest");
        assert_eq!(seen[0].authorization, None);
        assert_eq!(seen[1].authorization.as_deref(), Some("token abc"));
    }

    #[test]
    fn http_feed_download_source_depends_on_token() {
        let (base, server) = serve(|_| vec![(200, b"public".to_vec()), (200, b"private".to_vec())]);
        let sink = RecordingSink::default();
        let feed = HttpFeed::new(&sink, CancelToken::new()).unwrap();
        let release = ReleaseInfo {
            tag:          "v2.0.0".to_string(),
            download_url: format!("{base}/download"),
            asset_url:    format!("{base}/asset"),
        };

        let mut public = Vec::new();
        assert_eq!(feed.download(&release, None, &mut public).unwrap(), Fetch::Ready(6));
        let mut private = Vec::new();
        assert_eq!(
            feed.download(&release, Some("token abc"), &mut private).unwrap(),
            Fetch::Ready(7)
        );
        assert_eq!(public, b"public");
        assert_eq!(private, b"private");
        assert_eq!(sink.advanced.get(), 13);

        let seen = server.join().unwrap();
        assert_eq!(seen[0].url, "/download");
        assert_eq!(seen[0].authorization, None);
        assert_eq!(seen[1].url, "/asset");
        assert_eq!(seen[1].authorization.as_deref(), Some("token abc"));
        assert_eq!(seen[1].accept.as_deref(), Some("application/octet-stream"));
    }

    #[test]
    fn http_feed_rejects_error_status() {
        let (base, server) = serve(|_| vec![(500, b"oops".to_vec())]);
        let sink = RecordingSink::default();
        let feed = HttpFeed::new(&sink, CancelToken::new()).unwrap();

        let err = feed.fetch_latest(&format!("{base}/releases/latest"), None).unwrap_err();
        assert!(matches!(err, FeedError::Unreachable { .. }), "{err}");
        server.join().unwrap();
    }

    #[test]
    fn latest_tag_reads_tag_name() {
        let (base, server) = serve(|_| vec![(200, br#"{"tag_name": "v5", "name": "Five"}"#.to_vec())]);
        let sink = RecordingSink::default();
        let feed = HttpFeed::new(&sink, CancelToken::new()).unwrap().with_api(&base);

        let tag = feed.latest_tag("acme", "pack").unwrap();
        assert_eq!(tag, Fetch::Ready("v5".to_string()));

        let seen = server.join().unwrap();
        assert_eq!(seen[0].url, "/repos/acme/pack/releases/latest");
        assert_eq!(seen[0].accept.as_deref(), Some("application/vnd.github+json"));
    }

    #[test]
    fn latest_tag_not_found_is_unreachable() {
        let (base, server) = serve(|_| vec![(404, br#"{"message": "Not Found"}"#.to_vec())]);
        let sink = RecordingSink::default();
        let feed = HttpFeed::new(&sink, CancelToken::new()).unwrap().with_api(&base);

        let err = feed.latest_tag("acme", "missing").unwrap_err();
        assert!(matches!(err, FeedError::Unreachable { .. }), "{err}");
        server.join().unwrap();
    }

    #[test]
    fn latest_tag_without_tag_name_is_format_error() {
        let (base, server) = serve(|_| vec![(200, br#"{"name": "Five"}"#.to_vec())]);
        let sink = RecordingSink::default();
        let feed = HttpFeed::new(&sink, CancelToken::new()).unwrap().with_api(&base);

        let err = feed.latest_tag("acme", "pack").unwrap_err();
        assert!(matches!(err, FeedError::Format(ref m) if m.contains("tag_name")), "{err}");
        server.join().unwrap();
    }

    #[test]
    fn stalled_tag_lookup_is_cancelled_promptly() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}", server.server_addr().to_ip().unwrap());
        thread::spawn(move || {
            // Accept the request but never answer it.
            let request = server.recv();
            thread::sleep(Duration::from_secs(5));
            drop(request);
        });

        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let feed = HttpFeed::new(&sink, cancel).unwrap().with_api(&base);
        let started = Instant::now();
        let result = feed.latest_tag("acme", "pack");
        assert!(matches!(result, Ok(Fetch::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
