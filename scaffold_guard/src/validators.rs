//! Validation of the scaffold target's project name.
//!
//! The project name ends up in directory names, package metadata and import
//! paths, so it is restricted to a conservative identifier-like shape.

use std::sync::OnceLock;

use regex::Regex;

/// Names that collide with conventional project layout directories.
pub const RESERVED_PROJECT_NAMES: &[&str] = &[
    "test",
    "tests",
    "src",
    "lib",
    "bin",
    "build",
    "dist",
    "setup",
    "config",
    "settings",
    "core",
    "main",
    "app",
    "site-packages",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectNameOptions {
    pub max_length: usize,
    pub allow_hyphen: bool,
    pub allow_underscore: bool,
}

impl Default for ProjectNameOptions {
    fn default() -> Self {
        Self {
            max_length: 100,
            allow_hyphen: true,
            allow_underscore: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectNameError {
    #[error("Project name cannot be empty")]
    Empty,
    #[error("Project name exceeds maximum length of {max}")]
    TooLong { max: usize },
    #[error("Project name must start with a letter")]
    MustStartWithLetter,
    #[error("Project name contains invalid characters. Allowed: {allowed}")]
    InvalidCharacters { allowed: String },
    #[error("Project name '{name}' is reserved")]
    Reserved { name: String },
}

fn name_shape() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    SHAPE.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("project name regex must compile")
    })
}

/// Validate `name`, returning it unchanged when acceptable.
pub fn validate_project_name<'a>(
    name: &'a str,
    options: &ProjectNameOptions,
) -> Result<&'a str, ProjectNameError> {
    if name.is_empty() {
        return Err(ProjectNameError::Empty);
    }
    if name.chars().count() > options.max_length {
        return Err(ProjectNameError::TooLong {
            max: options.max_length,
        });
    }

    let disallowed_separator = (!options.allow_hyphen && name.contains('-'))
        || (!options.allow_underscore && name.contains('_'));
    if !name_shape().is_match(name) || disallowed_separator {
        if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(ProjectNameError::MustStartWithLetter);
        }
        let mut allowed = String::from("letters, numbers");
        if options.allow_hyphen {
            allowed.push_str(", hyphens");
        }
        if options.allow_underscore {
            allowed.push_str(", underscores");
        }
        return Err(ProjectNameError::InvalidCharacters { allowed });
    }

    let lower = name.to_ascii_lowercase();
    if RESERVED_PROJECT_NAMES.contains(&lower.as_str()) {
        return Err(ProjectNameError::Reserved {
            name: name.to_string(),
        });
    }
    Ok(name)
}
