use crate::cli::args::ValidateArgs;
use crate::exit_codes::OK;
use prism_core::load_config;

pub fn run(args: ValidateArgs) -> anyhow::Result<i32> {
    match load_config(&args.config) {
        Ok(cfg) => {
            println!(
                "{}: ok ({} model(s), {} mode, cache at {})",
                args.config.display(),
                cfg.models.len(),
                serde_json::to_value(cfg.execution)?.as_str().unwrap_or("parallel"),
                cfg.cache_path.display()
            );
            Ok(OK)
        }
        Err(e) => {
            eprintln!("{}: {}", args.config.display(), e);
            Ok(e.exit_code())
        }
    }
}
