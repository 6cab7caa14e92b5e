use anyhow::{Result, anyhow};
use clap::Parser;
use scaffold_guard::{GuardConfig, ProjectNameOptions, validate_project_name};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{error, info, instrument, warn};

/// Scaffold Guard Configuration Validator
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about = "Validates guard configuration files (allowlist, retry, breaker and exit-code settings) before a bootstrap run uses them."
)]
struct Cli {
    /// A config file, a directory of .toml/.json configs, or a comma-separated list of either.
    #[arg(default_value = "scaffold_guard.toml")]
    validation_target: String,

    /// Also validate a project name against the scaffold naming rules.
    #[arg(long)]
    project_name: Option<String>,

    /// Do not require allowlisted executables to exist on this machine.
    #[arg(long)]
    skip_exec_check: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

#[instrument]
fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    scaffold_guard::utils::logging::init_logging(log_level, false)?;

    if run_validation_mode(&cli)? {
        info!("All configurations are valid.");
        Ok(())
    } else {
        Err(anyhow!(
            "Some configurations are invalid. Please check the error messages above."
        ))
    }
}

fn run_validation_mode(cli: &Cli) -> Result<bool> {
    let mut all_valid = true;

    if let Some(name) = &cli.project_name {
        match validate_project_name(name, &ProjectNameOptions::default()) {
            Ok(_) => info!("Project name '{name}' is valid."),
            Err(e) => {
                error!("{e}");
                all_valid = false;
            }
        }
    }

    let mut files_to_validate = Vec::new();
    for target in cli.validation_target.split(',').map(str::trim) {
        let path = PathBuf::from(target);
        if path.is_dir() {
            files_to_validate.extend(get_config_files(&path)?);
        } else if path.is_file() {
            files_to_validate.push(path);
        } else {
            error!("Validation target not found: {}", path.display());
            all_valid = false;
        }
    }

    for file_path in files_to_validate {
        let problems = validate_file(&file_path, !cli.skip_exec_check);
        if problems.is_empty() {
            info!("{} is valid.", file_path.display());
        } else {
            for problem in &problems {
                error!("{}: {problem}", file_path.display());
            }
            all_valid = false;
        }
    }

    Ok(all_valid)
}

/// Every problem found in one config file.
fn validate_file(path: &Path, check_executables: bool) -> Vec<String> {
    let config = match GuardConfig::load_from_file(path) {
        Ok(config) => config,
        Err(e) => return vec![format!("{e:#}")],
    };

    let mut problems = config.validate();
    if config.allowlist.is_empty() {
        warn!(
            "{} has an empty allowlist; no command can run",
            path.display()
        );
    }
    if check_executables {
        for (name, exe) in config.missing_executables() {
            problems.push(format!(
                "allowlist entry '{name}' points to '{}', which is not an existing file",
                exe.display()
            ));
        }
    }
    problems
}

fn get_config_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_config = matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("toml") | Some("json")
        );
        if path.is_file() && is_config {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
