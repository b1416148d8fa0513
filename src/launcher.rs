//! Launch state machine:
//!
//! ```text
//! Start -> ChainloadCheck -> Dispatched
//!                         -> NormalPath -> UpdateCheck (skip | attempt) -> Launch
//! ```
//!
//! Dispatch and launch are both terminal. `--help` is answered after the
//! chainload check, so a chainload target handles it itself. Only a configuration error, a
//! malformed chainload file, a failed restore or a failed handoff stop the run
//! early; an update that merely did not happen never blocks the launch.

use std::path::PathBuf;

use clap::CommandFactory;
use thiserror::Error;
use tracing::info;

use crate::args::{self, PackSource};
use crate::chainload::{self, ChainloadError, ChainloadTarget, ConfigSource};
use crate::config::{self, Cli, ConfigError, LaunchConfig};
use crate::exec::{self, ExecError, TargetRunner};
use crate::feed::{Fetch, ReleaseFeed};
use crate::progress::ProgressSink;
use crate::update::{AtomicUpdater, UpdateError, UpdateOutcome, VersionProbe};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dispatch(#[from] ChainloadError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Launch(#[from] ExecError),
}

impl LaunchError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Dispatch(_) => "DispatchConfigError",
            Self::Update(e) => e.category(),
            Self::Launch(_) => "LaunchFailure",
        }
    }

    /// Heading shown above the error, matching the stage that failed.
    pub fn context(&self) -> &'static str {
        match self {
            Self::Config(ConfigError::TagLookup { .. }) => {
                "There was an error resolving the pack release:"
            }
            Self::Config(_) => "There was an error parsing command line arguments:",
            Self::Dispatch(_) => "There was an error reading the chainload configuration:",
            Self::Update(_) => "Updating packwiz-installer failed and it could not be restored:",
            Self::Launch(_) => "There was an error loading packwiz-installer:",
        }
    }
}

/// Result of the `Start` state: everything known before any lookup.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub cli:      Cli,
    /// Output of the argument filter; chainload targets receive this as-is.
    pub filtered: Vec<String>,
    pub config:   LaunchConfig,
    pub source:   Option<PackSource>,
}

/// Filter and parse the raw command line. Never touches the network.
pub fn start<I, S>(raw: I) -> Result<Invocation, LaunchError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let filtered = args::filter_args(&Cli::command(), raw);
    let cli = Cli::parse_filtered(&filtered)?;
    let source = PackSource::from_cli(&cli)?;
    let config = LaunchConfig::from_cli(&cli);
    Ok(Invocation {
        cli,
        filtered,
        config,
        source,
    })
}

#[derive(Debug)]
pub enum RunOutcome {
    /// `--help` was requested; the rendered text.
    Help(String),
    Dispatched {
        target:  ChainloadTarget,
        program: PathBuf,
    },
    Launched {
        /// `None` when the update check was skipped.
        update:    Option<UpdateOutcome>,
        exit_code: i32,
    },
    /// The user aborted before the pack could be located.
    Cancelled,
}

/// The collaborators of one run.
pub struct Launcher<'a> {
    /// Chainload configuration, highest precedence first.
    pub sources: Vec<&'a dyn ConfigSource>,
    pub feed:    &'a dyn ReleaseFeed,
    pub probe:   &'a dyn VersionProbe,
    pub runner:  &'a dyn TargetRunner,
    pub sink:    &'a dyn ProgressSink,
}

impl Launcher<'_> {
    pub fn run(&self, invocation: &Invocation) -> Result<RunOutcome, LaunchError> {
        let config = &invocation.config;

        // ChainloadCheck. A chainload target also owns `--help`.
        let target = chainload::resolve(&self.sources)?;
        if let Some(program) = exec::resolve_program(&target)? {
            info!(program = %program.display(), "chainloading");
            self.runner.hand_off(&program, &invocation.filtered)?;
            return Ok(RunOutcome::Dispatched { target, program });
        }

        if invocation.cli.show_help {
            return Ok(RunOutcome::Help(self.help(config)));
        }

        // NormalPath
        let source = invocation
            .source
            .as_ref()
            .ok_or(ConfigError::MissingSource)?;
        let locator = match source.resolve(self.feed)? {
            Fetch::Ready(locator) => locator,
            Fetch::Cancelled => {
                info!("pack lookup cancelled, nothing to launch");
                return Ok(RunOutcome::Cancelled);
            }
        };
        let target_args = args::target_args(locator, &invocation.cli);

        // UpdateCheck
        let update = if config.skip_update {
            info!("update check skipped");
            None
        } else {
            match AtomicUpdater::new(self.feed).ensure_up_to_date(config, self.probe) {
                UpdateOutcome::Failed(e) if e.is_fatal() => return Err(e.into()),
                UpdateOutcome::Failed(e) => {
                    self.sink.report_error(
                        e.category(),
                        "There was an error downloading packwiz-installer:",
                        &e,
                    );
                    Some(UpdateOutcome::Failed(e))
                }
                outcome => Some(outcome),
            }
        };
        if let Some(UpdateOutcome::Updated { tag }) = &update {
            info!(%tag, "packwiz-installer updated");
        }

        // Launch
        info!(target = %config.target_path.display(), "launching packwiz-installer");
        let exit_code = self.runner.hand_off(&config.target_path, &target_args)?;
        Ok(RunOutcome::Launched { update, exit_code })
    }

    fn help(&self, config: &LaunchConfig) -> String {
        let present = config.target_path.is_file();
        let options = if present {
            self.runner.describe_options(&config.target_path)
        } else {
            None
        };
        config::render_help(present, options.as_deref())
    }
}
