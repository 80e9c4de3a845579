use clap::Parser;

fn main() {
    let args = match elf2efi::cli::Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = i32::from(err.use_stderr());
            let _ = err.print();
            std::process::exit(code);
        }
    };
    if let Err(err) = elf2efi::run(args) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
