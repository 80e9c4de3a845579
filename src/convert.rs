use anyhow::{Context, Result};

use crate::cli::Args;
use crate::format::elf::parse_executable;
use crate::writer;

/// Runs one whole conversion: load the ELF, parse it, shift everything to
/// the requested base, apply the relocations, and write the PE image.
pub fn run(args: Args) -> Result<()> {
    let verbosity = args.verbose;

    let elf = std::fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input))?;
    let mut exec = parse_executable(&elf, verbosity)
        .with_context(|| format!("failed to convert {}", args.input))?;
    drop(elf);

    exec.relocate(args.base_address, verbosity);
    exec.apply_relocations(verbosity)
        .with_context(|| format!("failed to convert {}", args.input))?;

    let reloc_table = writer::build_base_relocations(&exec, args.base_address, verbosity);
    writer::write_output(&args.output, &exec, args.base_address, &reloc_table, verbosity)?;

    if verbosity >= 1 {
        eprintln!("wrote output: {}", args.output);
    }
    Ok(())
}
