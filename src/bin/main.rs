//! PE/PDB canonicalization CLI.
//!
//! Rewrites a PE image and its PDB so identical builds produce
//! byte-identical files.

use clap::Parser;
use miette::Result;
use pecanon::{CanonicalizeOptions, CanonicalizeWorkflow};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pecanon")]
#[command(about = "Make a PE image and its PDB byte-for-byte reproducible")]
#[command(long_about = "
pecanon - deterministic PE/PDB rewriter

Rewrites linker timestamps to a fixed value, derives the PDB signature
from the image contents, zeroes uninitialized padding in the PDB, and
recomputes the PE checksum. Two identical builds then hash identically.

EXAMPLES:
    # Canonicalize in place (PDB located via the image's CodeView record)
    pecanon --input-image app.dll --overwrite

    # Write canonicalized copies elsewhere
    pecanon --input-image app.dll --output-image out/app.dll

    # Image only, leaving the PDB untouched
    pecanon --input-image app.dll --overwrite --no-write-pdb

ENVIRONMENT VARIABLES:
    RUST_LOG        Logging level (debug, info, warn, error)
")]
#[command(version)]
struct Cli {
    /// PE image to canonicalize
    #[arg(long, value_name = "FILE")]
    input_image: PathBuf,

    /// Matching PDB file (located via the image's CodeView record if omitted)
    #[arg(long, value_name = "FILE")]
    input_pdb: Option<PathBuf>,

    /// Output image path (defaults to rewriting the input image in place)
    #[arg(long, value_name = "FILE")]
    output_image: Option<PathBuf>,

    /// Output PDB path (defaults to a path derived from the output image)
    #[arg(long, value_name = "FILE")]
    output_pdb: Option<PathBuf>,

    /// Allow replacing existing output files
    #[arg(long)]
    overwrite: bool,

    /// Skip writing the image
    #[arg(long)]
    no_write_image: bool,

    /// Skip writing the PDB
    #[arg(long)]
    no_write_pdb: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    let options = CanonicalizeOptions {
        input_image: cli.input_image,
        input_pdb: cli.input_pdb,
        output_image: cli.output_image,
        output_pdb: cli.output_pdb,
        overwrite: cli.overwrite,
        write_image: !cli.no_write_image,
        write_pdb: !cli.no_write_pdb,
    };

    CanonicalizeWorkflow::new(options).run()?;
    Ok(())
}
