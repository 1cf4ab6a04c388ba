//! Routes parsed CLI arguments to their command handlers.

pub mod check;
pub mod serve;
pub mod version;

use tokio_util::sync::CancellationToken;

use crate::cli::args::{Cli, Commands};
use crate::error::TapedeckError;

/// Runs the command selected by `cli`.
///
/// # Errors
///
/// Returns an error if the command fails.
pub async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<(), TapedeckError> {
    match cli.command {
        Commands::Serve(args) => serve::run(&args, cancel).await,
        Commands::Check(args) => check::run(&args),
        Commands::Version(args) => {
            version::run(&args);
            Ok(())
        }
    }
}
