use stackvars::*;

use std::path::PathBuf;

use clap::Parser;

use stackvars::arch::RegisterArch;
use stackvars::decompiler::{Decompiler, Phase};
use stackvars::listing::Listing;

/// Recover stack variables from register-transfer listings
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Decompile the function described by a textual listing
    FromListing {
        /// Path to the listing file
        listing: PathBuf,
        /// Entry point of the function (decimal or `0x` hex). Defaults to the listing's `ENTRY`
        /// directive, or its lowest address.
        #[clap(long)]
        entry: Option<String>,
        /// Stop after reaching this phase (by name, e.g. `ssa-registers`)
        #[clap(long)]
        until: Option<Phase>,
        /// Path to output file for the resulting flow; printed to stdout if not provided
        #[clap(long)]
        output: Option<PathBuf>,
        /// Output the resulting block graph as a GraphViz `.dot` file to the given path
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
        /// Advanced configuration options to tweak decompilation behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineDecompilerConfig>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::FromListing {
            listing,
            entry,
            until,
            output,
            debug_output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let logger = match crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ) {
                Ok(l) => l,
                Err(e) => {
                    eprintln!("Could not set up logging: {}", e);
                    std::process::exit(2);
                }
            };
            let _log_guard = slog_scope::set_global_logger(logger);

            config::DecompilerConfig::initialize(advanced_config);

            if let Err(e) = run(listing, entry, until, output, debug_output_graphviz) {
                log::error!("Decompilation failed"; "error" => %e);
                eprintln!("Error: {}", e);
                let mut source = e.source();
                while let Some(s) = source {
                    eprintln!("  caused by: {}", s);
                    source = s.source();
                }
                std::process::exit(1);
            }

            log::trace!("Done");
        }
    }
}

fn run(
    listing: PathBuf,
    entry: Option<String>,
    until: Option<Phase>,
    output: Option<PathBuf>,
    debug_output_graphviz: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    use std::io::Write;

    let text = std::fs::read_to_string(&listing)
        .map_err(|e| format!("Listing file {} could not be read: {}", listing.display(), e))?;
    let listing = Listing::parse(&text)?;

    let arch = match &listing.arch {
        Some(name) => RegisterArch::by_name(name)
            .ok_or_else(|| format!("Unknown architecture `{}`", name))?,
        None => RegisterArch::x86(),
    };
    let ea = match entry {
        Some(e) => stackvars::listing::parse_address(&e).ok_or_else(|| format!("Bad entry address `{}`", e))?,
        None => listing
            .entry_point()
            .ok_or("Listing does not name an entry point")?,
    };

    let mut decompiler = Decompiler::new(&listing, &arch, ea);
    decompiler.advance_to(until.unwrap_or_else(Phase::last))?;

    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout()),
    };
    for phase in decompiler.phases() {
        writeln!(out, "# {}", phase.description())?;
    }
    let stack_variables = decompiler.session().stack_variables();
    if !stack_variables.is_empty() {
        writeln!(out, "#")?;
        for (offset, name) in stack_variables {
            writeln!(out, "# {} = stack[{}]", name, offset)?;
        }
    }
    for reg in &decompiler.session().restored_locations {
        writeln!(out, "# restored: {}", reg)?;
    }
    writeln!(out)?;
    write!(out, "{:?}", decompiler.flow().debug_flow())?;

    if let Some(path) = debug_output_graphviz {
        let mut f = std::fs::File::create(path)?;
        decompiler.flow().render_dot(&mut f)?;
    }

    Ok(())
}
