use clap::Command;
use tracing::{debug, info};

use crate::config::{Cli, ConfigError};
use crate::feed::{Fetch, ReleaseFeed};

/// Raw-content location of a pack published in a GitHub repository.
pub fn pack_url(user: &str, repo: &str, tag: &str) -> String {
    format!("https://raw.githubusercontent.com/{user}/{repo}/refs/tags/{tag}/pack.toml")
}

fn is_locator(arg: &str) -> bool {
    arg.starts_with("https://") || arg.starts_with("http://")
}

/// Look up a `-x`, `--long` or `--long=value` token among the options of
/// `command`. Returns whether the option consumes the following token.
fn option_arity(command: &Command, token: &str) -> Option<bool> {
    if let Some(long) = token.strip_prefix("--") {
        let (name, inline_value) = match long.split_once('=') {
            Some((name, _)) => (name, true),
            None => (long, false),
        };
        let arg = command.get_arguments().find(|a| a.get_long() == Some(name))?;
        return Some(!inline_value && arg.get_action().takes_values());
    }
    let mut chars = token.strip_prefix('-')?.chars();
    let short = match (chars.next(), chars.next()) {
        (Some(short), None) => short,
        _ => return None,
    };
    let arg = command.get_arguments().find(|a| a.get_short() == Some(short))?;
    Some(arg.get_action().takes_values())
}

/// Keep only what the launcher understands: its own options (with their
/// values) and the first URL-like positional, in their original order.
///
/// Everything else, such as runtime flags meant for some other program, is
/// dropped without complaint.
pub fn filter_args<I, S>(command: &Command, raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut filtered = Vec::new();
    let mut expect_value = false;
    let mut got_locator = false;

    for arg in raw.into_iter().map(Into::into) {
        if expect_value {
            filtered.push(arg);
            expect_value = false;
            continue;
        }
        if arg.len() > 1 && arg.starts_with('-') {
            match option_arity(command, &arg) {
                Some(takes_value) => {
                    expect_value = takes_value;
                    filtered.push(arg);
                }
                None => debug!(%arg, "dropping unrecognised option"),
            }
        } else if is_locator(&arg) && !got_locator {
            got_locator = true;
            filtered.push(arg);
        } else {
            debug!(%arg, "dropping positional argument");
        }
    }
    filtered
}

/// Where the pack comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackSource {
    Url(String),
    Repository {
        user: String,
        repo: String,
        tag:  Option<String>,
    },
}

impl PackSource {
    /// A direct URL and a repository reference are mutually exclusive.
    /// `Ok(None)` means neither was given.
    pub fn from_cli(cli: &Cli) -> Result<Option<Self>, ConfigError> {
        let has_repo_args = cli.user.is_some() || cli.repo.is_some() || cli.tag.is_some();
        match (&cli.pack_url, has_repo_args) {
            (Some(_), true) => Err(ConfigError::ConflictingSources),
            (Some(url), false) => Ok(Some(Self::Url(url.clone()))),
            (None, _) => match (&cli.user, &cli.repo) {
                (Some(user), Some(repo)) => Ok(Some(Self::Repository {
                    user: user.clone(),
                    repo: repo.clone(),
                    tag:  cli.tag.clone(),
                })),
                _ if has_repo_args => Err(ConfigError::MissingSource),
                _ => Ok(None),
            },
        }
    }

    /// The pack URL to hand to packwiz-installer. A repository reference
    /// without a tag asks the feed for the latest release, which the user
    /// may cancel.
    pub fn resolve(&self, feed: &dyn ReleaseFeed) -> Result<Fetch<String>, ConfigError> {
        match self {
            Self::Url(url) => Ok(Fetch::Ready(url.clone())),
            Self::Repository { user, repo, tag: Some(tag) } => {
                Ok(Fetch::Ready(pack_url(user, repo, tag)))
            }
            Self::Repository { user, repo, tag: None } => {
                let lookup = feed.latest_tag(user, repo).map_err(|source| ConfigError::TagLookup {
                    user: user.clone(),
                    repo: repo.clone(),
                    source,
                })?;
                match lookup {
                    Fetch::Ready(tag) => {
                        info!(%user, %repo, %tag, "resolved latest pack release");
                        Ok(Fetch::Ready(pack_url(user, repo, &tag)))
                    }
                    Fetch::Cancelled => Ok(Fetch::Cancelled),
                }
            }
        }
    }
}

/// Arguments for packwiz-installer: the pack URL, then `-s <side>`, then `-g`.
pub fn target_args(locator: String, cli: &Cli) -> Vec<String> {
    let mut args = vec![locator];
    if let Some(side) = &cli.side {
        args.push("-s".to_string());
        args.push(side.clone());
    }
    if cli.no_gui {
        args.push("-g".to_string());
    }
    args
}
