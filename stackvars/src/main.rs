use stackvars::*;

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

/// Recover stack variables from disassembled binaries
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Recover stack variables from a disassembler listing export
    FromListing {
        /// Path to an exported listing file (functions, frames, basic blocks, and instructions)
        exported_listing: PathBuf,
        /// Path to output file for the human-readable report
        #[clap(long)]
        output: Option<PathBuf>,
        /// Path to output file for the machine-readable form of the recovered variables
        #[clap(long)]
        output_serialized: Option<PathBuf>,
        /// Output the lifted control-flow graphs as a GraphViz `.dot` file to the given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the analysis behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<analysis_config::CommandLineAnalysisConfig>,
    },
}

fn write_to(path: &std::path::Path, contents: &str) -> anyhow::Result<()> {
    let mut f = std::fs::File::create(path)
        .with_context(|| format!("Could not create {}", path.display()))?;
    write!(f, "{}", contents).with_context(|| format!("Could not write {}", path.display()))?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::FromListing {
            exported_listing,
            output,
            output_serialized,
            debug_output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let logger = crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            )
            .map_err(|e| anyhow::anyhow!("Could not set up logging: {}", e))?;
            let _log_guard = slog_scope::set_global_logger(logger);

            let config = analysis_config::AnalysisConfig::from(advanced_config);

            let listing = std::fs::read_to_string(&exported_listing).with_context(|| {
                format!("Listing file {} could not be read", exported_listing.display())
            })?;
            let prog = listing_lifter::lift_from(&listing).with_context(|| {
                format!("Could not lift listing {}", exported_listing.display())
            })?;

            if let Some(path) = debug_output_graphviz {
                write_to(&path, &cfg_dot::generate_dot(&prog)?)?;
            }

            let recovered = driver::recover_all(&prog, &config);

            if let Some(path) = output_serialized {
                write_to(&path, &report::serialize(&recovered))?;
            }

            let printable = report::PrintableStackVariables::new(&recovered);
            if let Some(path) = output {
                write_to(&path, &printable.to_string())?;
            } else {
                println!("{}", printable);
            }

            log::trace!("Done");
        }
    }

    Ok(())
}
