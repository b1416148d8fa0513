//! Fakes for the seam traits, shared by the unit tests of every module.

use std::cell::{Cell, RefCell};
use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::LaunchConfig;
use crate::exec::{ExecError, TargetOption, TargetRunner};
use crate::feed::{parse_release, Fetch, FeedError, ReleaseFeed, ReleaseInfo};
use crate::progress::{render, ProgressSink};

// Serialize env-var tests to prevent interference between parallel test threads.
static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub const FEED_URL: &str = "https://feed.test/releases/latest";

pub fn config_for(dir: &Path) -> LaunchConfig {
    LaunchConfig {
        update_url:   FEED_URL.to_string(),
        access_token: None,
        skip_update:  false,
        interactive:  false,
        target_path:  dir.join("packwiz-installer"),
    }
}

pub fn release(tag: &str) -> ReleaseInfo {
    ReleaseInfo {
        tag:          tag.to_string(),
        download_url: format!("https://dl.test/{tag}/packwiz-installer"),
        asset_url:    format!("https://api.test/assets/{tag}"),
    }
}

pub enum FetchPlan {
    Release(ReleaseInfo),
    Cancelled,
    Unreachable,
    MissingAssets,
}

pub enum DownloadPlan {
    Complete(Vec<u8>),
    /// Write the bytes, then fail with a connection reset.
    FailAfter(Vec<u8>),
    /// Write the bytes, then observe a cancellation.
    CancelAfter(Vec<u8>),
    /// Delete the file at the path (the backup copy), then fail.
    FailLosingBackup(PathBuf),
}

pub struct FakeFeed {
    pub fetch:       FetchPlan,
    pub download:    DownloadPlan,
    /// `None` makes the lookup fail.
    pub tag:         Option<Fetch<String>>,
    pub fetches:     Cell<usize>,
    pub downloads:   Cell<usize>,
    pub tag_lookups: Cell<usize>,
    pub last_token:  RefCell<Option<String>>,
}

impl FakeFeed {
    pub fn new(fetch: FetchPlan) -> Self {
        Self {
            fetch,
            download: DownloadPlan::Complete(Vec::new()),
            tag: None,
            fetches: Cell::new(0),
            downloads: Cell::new(0),
            tag_lookups: Cell::new(0),
            last_token: RefCell::new(None),
        }
    }

    pub fn releasing(tag: &str, download: DownloadPlan) -> Self {
        Self {
            download,
            ..Self::new(FetchPlan::Release(release(tag)))
        }
    }

    pub fn with_latest_tag(mut self, tag: &str) -> Self {
        self.tag = Some(Fetch::Ready(tag.to_string()));
        self
    }

    pub fn with_cancelled_tag_lookup(mut self) -> Self {
        self.tag = Some(Fetch::Cancelled);
        self
    }

    pub fn network_calls(&self) -> usize {
        self.fetches.get() + self.downloads.get() + self.tag_lookups.get()
    }
}

impl ReleaseFeed for FakeFeed {
    fn fetch_latest(
        &self,
        feed_url: &str,
        token: Option<&str>,
    ) -> Result<Fetch<ReleaseInfo>, FeedError> {
        self.fetches.set(self.fetches.get() + 1);
        *self.last_token.borrow_mut() = token.map(str::to_string);
        match &self.fetch {
            FetchPlan::Release(release) => Ok(Fetch::Ready(release.clone())),
            FetchPlan::Cancelled => Ok(Fetch::Cancelled),
            FetchPlan::Unreachable => Err(FeedError::Unreachable {
                url:    feed_url.to_string(),
                source: Box::new(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
            }),
            FetchPlan::MissingAssets => {
                parse_release(br#"{"tag_name": "v9.9.9"}"#, "packwiz-installer").map(Fetch::Ready)
            }
        }
    }

    fn download(
        &self,
        _release: &ReleaseInfo,
        _token: Option<&str>,
        out: &mut dyn Write,
    ) -> io::Result<Fetch<u64>> {
        self.downloads.set(self.downloads.get() + 1);
        match &self.download {
            DownloadPlan::Complete(bytes) => {
                out.write_all(bytes)?;
                Ok(Fetch::Ready(bytes.len() as u64))
            }
            DownloadPlan::FailAfter(bytes) => {
                out.write_all(bytes)?;
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
            }
            DownloadPlan::CancelAfter(bytes) => {
                out.write_all(bytes)?;
                Ok(Fetch::Cancelled)
            }
            DownloadPlan::FailLosingBackup(backup) => {
                std::fs::remove_file(backup)?;
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
            }
        }
    }

    fn latest_tag(&self, user: &str, repo: &str) -> Result<Fetch<String>, FeedError> {
        self.tag_lookups.set(self.tag_lookups.get() + 1);
        self.tag.clone().ok_or_else(|| FeedError::Unreachable {
            url:    format!("https://api.test/repos/{user}/{repo}/releases/latest"),
            source: "HTTP 404 Not Found".into(),
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub advanced: Cell<u64>,
    pub errors:   RefCell<Vec<(String, String)>>, // (category, rendered chain)
}

impl ProgressSink for RecordingSink {
    fn start(&self, _message: &str, _total: Option<u64>) {}

    fn advance(&self, bytes: u64) {
        self.advanced.set(self.advanced.get() + bytes);
    }

    fn finish(&self) {}

    fn report_error(&self, category: &str, _context: &str, error: &(dyn Error + 'static)) {
        self.errors
            .borrow_mut()
            .push((category.to_string(), render(error)));
    }
}

#[derive(Default)]
pub struct FakeRunner {
    pub calls:   RefCell<Vec<(PathBuf, Vec<String>)>>,
    pub options: Option<Vec<TargetOption>>,
    pub version: Option<String>,
    pub exit:    i32,
}

impl TargetRunner for FakeRunner {
    fn hand_off(&self, program: &Path, args: &[String]) -> Result<i32, ExecError> {
        self.calls
            .borrow_mut()
            .push((program.to_path_buf(), args.to_vec()));
        Ok(self.exit)
    }

    fn describe_options(&self, _artifact: &Path) -> Option<Vec<TargetOption>> {
        self.options.clone()
    }

    fn query_version(&self, _artifact: &Path) -> Option<String> {
        self.version.clone()
    }
}
