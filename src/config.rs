use std::path::PathBuf;

use clap::{CommandFactory, Parser};
use thiserror::Error;

use crate::exec::TargetOption;
use crate::feed::{FeedError, ARTIFACT_NAME};

pub const DEFAULT_UPDATE_URL: &str =
    "https://api.github.com/repos/codecraft3r/packwiz-installer/releases/latest";

pub const BIN_NAME: &str = "packwiz-installer-bootstrap";

const MISSING_TARGET_HELP: &str =
    "Options for packwiz-installer will be visible once it has been downloaded.\n";

/// Launcher command line. Only ever parsed from the output of
/// [`crate::args::filter_args`], which also derives its option table from here.
#[derive(Debug, Clone, Parser)]
#[command(
    name = BIN_NAME,
    about = "Keeps packwiz-installer up to date, then runs it",
    disable_help_flag = true
)]
pub struct Cli {
    /// URL of the pack.toml to install
    #[arg(value_name = "PACK_URL")]
    pub pack_url: Option<String>,

    /// Github API URL for checking for updates
    #[arg(
        long = "bootstrap-update-url",
        value_name = "URL",
        env = "PACKWIZ_BOOTSTRAP_UPDATE_URL",
        default_value = DEFAULT_UPDATE_URL
    )]
    pub update_url: String,

    /// Github API access token, for private repositories
    #[arg(
        long = "bootstrap-update-token",
        value_name = "TOKEN",
        env = "PACKWIZ_BOOTSTRAP_UPDATE_TOKEN",
        hide_env_values = true
    )]
    pub update_token: Option<String>,

    /// Don't update packwiz-installer
    #[arg(
        long = "bootstrap-no-update",
        env = "PACKWIZ_NO_UPDATE",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub no_update: bool,

    /// Location of the packwiz-installer executable
    #[arg(long = "bootstrap-target", value_name = "PATH")]
    pub target: Option<PathBuf>,

    /// Don't display interactive progress (also passed to packwiz-installer)
    #[arg(short = 'g', long = "no-gui")]
    pub no_gui: bool,

    /// Side to install, passed to packwiz-installer
    #[arg(short = 's', long = "side", value_name = "SIDE")]
    pub side: Option<String>,

    /// GitHub user or organisation hosting the pack
    #[arg(long, value_name = "GH_USER")]
    pub user: Option<String>,

    /// GitHub repository hosting the pack
    #[arg(long, value_name = "GH_REPO")]
    pub repo: Option<String>,

    /// Release tag of the pack (defaults to the latest release)
    #[arg(long, value_name = "GH_TAG")]
    pub tag: Option<String>,

    /// Display this message
    #[arg(short = 'h', long = "help")]
    pub show_help: bool,
}

impl Cli {
    /// Parse launcher arguments (without the program name).
    pub fn parse_filtered(args: &[String]) -> Result<Self, ConfigError> {
        Self::try_parse_from(std::iter::once(BIN_NAME.to_string()).chain(args.iter().cloned()))
            .map_err(ConfigError::Cli)
    }
}

/// Settings for one run, fixed once the command line has been parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub update_url:   String,
    pub access_token: Option<String>,
    pub skip_update:  bool,
    pub interactive:  bool,
    pub target_path:  PathBuf,
}

impl LaunchConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            update_url:   cli.update_url.clone(),
            access_token: cli.update_token.clone().filter(|t| !t.is_empty()),
            skip_update:  cli.no_update,
            interactive:  !cli.no_gui,
            target_path:  cli.target.clone().unwrap_or_else(default_target_path),
        }
    }
}

/// `packwiz-installer` (plus `.exe` on Windows) in the working directory.
pub fn default_target_path() -> PathBuf {
    PathBuf::from(format!("{ARTIFACT_NAME}{}", std::env::consts::EXE_SUFFIX))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid command line arguments")]
    Cli(#[source] clap::Error),
    #[error("cannot specify both a URL and GitHub parameters (--user/--repo/--tag)")]
    ConflictingSources,
    #[error("provide either one URL argument or --user <GH_USER> --repo <GH_REPO> [--tag <GH_TAG>]")]
    MissingSource,
    #[error("could not fetch the latest release tag of {user}/{repo}")]
    TagLookup {
        user:   String,
        repo:   String,
        #[source]
        source: FeedError,
    },
}

/// Launcher help followed by the options of the target artifact, if known.
pub fn render_help(artifact_present: bool, target_options: Option<&[TargetOption]>) -> String {
    let mut help = Cli::command().render_help().to_string();
    help.push('\n');
    match target_options {
        Some(options) => {
            help.push_str("packwiz-installer options:\n");
            for option in options {
                help.push_str(&option.help_line());
                help.push('\n');
            }
        }
        None if artifact_present => {
            help.push_str("packwiz-installer did not report its options.\n");
        }
        None => help.push_str(MISSING_TARGET_HELP),
    }
    help
}
