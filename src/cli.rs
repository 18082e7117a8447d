use std::path::PathBuf;

use crate::dataset::DEFAULT_DATA_DIR;
use crate::error::Result;

pub const HELP: &str = "\
Burn Distill

Trains a small student network on MNIST to mimic a teacher network, with a loss
blending the hard-label cross entropy and the temperature-softened KL divergence.

USAGE:
    burn-distill [OPTIONS]

Without options, training starts immediately with the default configuration.

FLAGS:
    -h, --help                  Show this help message and exit

OPTIONS:
    -c, --training-config <PATH>
                                Load the training configuration (json) from this file
    -d, --data-dir <PATH>       Directory where MNIST is downloaded and cached [default: ./data]
    -t, --teacher <PATH>        Load the teacher weights from this record file
                                (otherwise the teacher is randomly initialized)
";

#[derive(Debug, PartialEq)]
pub struct AppArgs {
    pub training_config: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub teacher: Option<PathBuf>,
}

/// Outcome of argument parsing.
#[derive(Debug, PartialEq)]
pub enum Command {
    Train(AppArgs),
    Help,
}

impl AppArgs {
    pub fn parse() -> Result<Command> {
        Self::parse_from(pico_args::Arguments::from_env())
    }

    pub fn parse_from(mut pargs: pico_args::Arguments) -> Result<Command> {
        // Help has a higher priority and should be handled separately.
        if pargs.contains(["-h", "--help"]) {
            return Ok(Command::Help);
        }

        let args = AppArgs {
            training_config: pargs
                .opt_value_from_os_str(["-c", "--training-config"], parse_path)?,
            data_dir: pargs
                .opt_value_from_os_str(["-d", "--data-dir"], parse_path)?
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            teacher: pargs.opt_value_from_os_str(["-t", "--teacher"], parse_path)?,
        };

        let remaining = pargs.finish();
        if !remaining.is_empty() {
            return Err(pico_args::Error::ArgumentParsingFailed {
                cause: format!("unused arguments: {remaining:?}"),
            }
            .into());
        }

        Ok(Command::Train(args))
    }
}

fn parse_path(s: &std::ffi::OsStr) -> std::result::Result<PathBuf, &'static str> {
    Ok(s.into())
}
