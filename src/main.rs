// src/main.rs

use simrunner::{cli, logging, run};

fn main() {
    match run_main() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("simrunner error: {err:?}");
            std::process::exit(1);
        }
    }
}

/// `Ok(false)` when a job was invalid or failed.
fn run_main() -> anyhow::Result<bool> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    let summary = run(args)?;
    Ok(summary.is_clean())
}
