// main.rs: logging, signal handling and exit codes only.
// The launch state machine lives in launcher.rs; main.rs only wires real
// implementations into it.
mod args;
mod chainload;
mod config;
mod exec;
mod feed;
mod launcher;
mod progress;
mod update;

#[cfg(test)]
mod testing;

use std::process::ExitCode;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use chainload::{ConfigSource, EnvSource, FileSource, CONFIG_FILE_NAME};
use exec::ProcessRunner;
use feed::{CancelToken, HttpFeed};
use launcher::{LaunchError, Launcher, RunOutcome};
use progress::{ConsoleSink, InteractiveSink, ProgressSink};
use update::ArtifactProbe;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn fail(sink: &dyn ProgressSink, err: &LaunchError) -> ExitCode {
    sink.report_error(err.category(), err.context(), err);
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    init_logging();

    let invocation = match launcher::start(std::env::args().skip(1)) {
        Ok(invocation) => invocation,
        Err(e) => return fail(&ConsoleSink::new(), &e),
    };

    let cancel = CancelToken::new();
    if let Err(e) = ctrlc::set_handler({
        let cancel = cancel.clone();
        move || {
            info!("cancel requested");
            cancel.cancel();
        }
    }) {
        warn!(error = %e, "could not install Ctrl+C handler, downloads cannot be cancelled");
    }

    let sink: Box<dyn ProgressSink> = if invocation.config.interactive {
        Box::new(InteractiveSink::new())
    } else {
        Box::new(ConsoleSink::new())
    };

    let feed = match HttpFeed::new(sink.as_ref(), cancel) {
        Ok(feed) => feed,
        Err(e) => {
            sink.report_error("FeedUnreachable", "Could not set up the HTTP client:", &e);
            return ExitCode::FAILURE;
        }
    };

    let environment = EnvSource::from_process();
    let file = FileSource::new(CONFIG_FILE_NAME);
    let sources: Vec<&dyn ConfigSource> = vec![&environment, &file];

    let probe = ArtifactProbe::new(&ProcessRunner);
    let launcher = Launcher {
        sources,
        feed: &feed,
        probe: &probe,
        runner: &ProcessRunner,
        sink: sink.as_ref(),
    };

    match launcher.run(&invocation) {
        Ok(RunOutcome::Help(text)) => {
            print!("{text}");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Dispatched { target, program }) => {
            debug!(?target, program = %program.display(), "chainload finished");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Launched { update, exit_code }) => {
            debug!(?update, exit_code, "packwiz-installer finished");
            ExitCode::from(u8::try_from(exit_code).unwrap_or(1))
        }
        Ok(RunOutcome::Cancelled) => ExitCode::FAILURE,
        Err(e) => fail(sink.as_ref(), &e),
    }
}
