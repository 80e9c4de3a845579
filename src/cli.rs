use clap::Parser;

/// Image base the output is linked at unless overridden with `-b`.
pub const DEFAULT_BASE_ADDRESS: u64 = 0x1000_0000;

fn parse_u64_with_hex(input: &str) -> Result<u64, String> {
    let s = input.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("invalid hex value '{input}': {e}"))
    } else {
        s.parse::<u64>()
            .map_err(|e| format!("invalid decimal value '{input}': {e}"))
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "elf2efi",
    version,
    about = "Convert ELF executables to PE files suitable for use as EFI applications"
)]
pub struct Args {
    /// PE base address, hex (0x-prefixed) or decimal
    #[arg(short = 'b', value_parser = parse_u64_with_hex, default_value_t = DEFAULT_BASE_ADDRESS)]
    pub base_address: u64,

    /// Increase verbosity; twice for per-entry decode detail
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(value_name = "ELF_INPUT")]
    pub input: String,

    #[arg(value_name = "PE_OUTPUT")]
    pub output: String,
}
