//! Input validation for identifiers and filesystem paths.
//!
//! Every task id, agent name, and hostname that reaches a subprocess
//! argument vector or a filesystem API passes through here first. Recipe
//! and lease paths are additionally confined to their base directories
//! after symlink resolution.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Maximum length for task ids and agent names.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Maximum length for hostnames (RFC 1123).
pub const MAX_HOSTNAME_LEN: usize = 253;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("empty {0} not allowed")]
    Empty(&'static str),

    #[error("{name} too long: {len} > {max}")]
    TooLong {
        name: &'static str,
        len: usize,
        max: usize,
    },

    #[error("invalid {name}: {value:?} - only alphanumeric, hyphens, and underscores allowed")]
    InvalidChars { name: &'static str, value: String },

    #[error("absolute recipe paths not allowed: {0}")]
    AbsolutePath(String),

    #[error("parent directory references not allowed in recipe: {0}")]
    ParentRef(String),

    #[error("recipe must have .yaml or .yml extension: {0}")]
    BadExtension(String),

    #[error("invalid characters in recipe path: {0:?}")]
    InvalidPathChars(String),

    #[error("path escapes {dir}: {path}")]
    PathEscape { path: String, dir: String },

    #[error("cannot resolve {path}: {source}")]
    Unresolvable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("file too large: {path} is {size} bytes (max {max} bytes)")]
    FileTooLarge {
        path: String,
        size: u64,
        max: u64,
    },
}

fn validate_identifier<'a>(value: &'a str, name: &'static str) -> Result<&'a str, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty(name));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            name,
            len: value.len(),
            max: MAX_IDENTIFIER_LEN,
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidChars {
            name,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Validate a task identifier for use in file paths and argument vectors.
pub fn validate_task_id(task_id: &str) -> Result<&str, ValidationError> {
    validate_identifier(task_id, "task_id")
}

/// Validate an agent name for use in file paths and argument vectors.
pub fn validate_agent_name(agent: &str) -> Result<&str, ValidationError> {
    validate_identifier(agent, "agent")
}

/// Validate a hostname for use in lease files and logging.
pub fn validate_hostname(hostname: &str) -> Result<&str, ValidationError> {
    if hostname.is_empty() {
        return Err(ValidationError::Empty("hostname"));
    }
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(ValidationError::TooLong {
            name: "hostname",
            len: hostname.len(),
            max: MAX_HOSTNAME_LEN,
        });
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ValidationError::InvalidChars {
            name: "hostname",
            value: hostname.to_string(),
        });
    }
    Ok(hostname)
}

/// Validate and resolve a recipe path, confining it to `recipes_dir`.
///
/// Rejects absolute paths, `..` components, anything without a
/// `.yaml`/`.yml` extension, and characters outside `[A-Za-z0-9._/-]`.
/// The resolved path must exist and stay inside the resolved recipes
/// directory even through symlinks.
pub fn validate_recipe_path(recipe: &str, recipes_dir: &Path) -> Result<PathBuf, ValidationError> {
    if recipe.is_empty() {
        return Err(ValidationError::Empty("recipe"));
    }
    if !recipe
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
    {
        return Err(ValidationError::InvalidPathChars(recipe.to_string()));
    }

    let recipe_path = Path::new(recipe);
    if recipe_path.is_absolute() {
        return Err(ValidationError::AbsolutePath(recipe.to_string()));
    }
    if recipe_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ValidationError::ParentRef(recipe.to_string()));
    }
    if !(recipe.ends_with(".yaml") || recipe.ends_with(".yml")) {
        return Err(ValidationError::BadExtension(recipe.to_string()));
    }

    let dir_resolved = recipes_dir
        .canonicalize()
        .map_err(|e| ValidationError::Unresolvable {
            path: recipes_dir.display().to_string(),
            source: e,
        })?;
    let full = recipes_dir.join(recipe_path);
    let full_resolved = full.canonicalize().map_err(|e| ValidationError::Unresolvable {
        path: full.display().to_string(),
        source: e,
    })?;

    if !full_resolved.starts_with(&dir_resolved) {
        return Err(ValidationError::PathEscape {
            path: recipe.to_string(),
            dir: recipes_dir.display().to_string(),
        });
    }

    Ok(full_resolved)
}

/// Construct the lease file path for a task, confining it to `lease_dir`.
///
/// The task id is charset-validated first, which rules out separators and
/// traversal. If the lease file already exists it is resolved and checked
/// against the resolved lease directory so a planted symlink cannot
/// redirect writes outside it.
pub fn validate_lease_path(task_id: &str, lease_dir: &Path) -> Result<PathBuf, ValidationError> {
    let task_id = validate_task_id(task_id)?;
    let path = lease_dir.join(format!("task_{}.json", task_id));

    if path.exists() {
        let dir_resolved = lease_dir
            .canonicalize()
            .map_err(|e| ValidationError::Unresolvable {
                path: lease_dir.display().to_string(),
                source: e,
            })?;
        let resolved = path.canonicalize().map_err(|e| ValidationError::Unresolvable {
            path: path.display().to_string(),
            source: e,
        })?;
        if resolved.parent() != Some(dir_resolved.as_path()) {
            return Err(ValidationError::PathEscape {
                path: path.display().to_string(),
                dir: lease_dir.display().to_string(),
            });
        }
    }

    Ok(path)
}

/// Reject JSON files above `max_bytes` before parsing them.
pub fn validate_json_file_size(path: &Path, max_bytes: u64) -> Result<(), ValidationError> {
    let meta = std::fs::metadata(path).map_err(|e| ValidationError::Unresolvable {
        path: path.display().to_string(),
        source: e,
    })?;
    if meta.len() > max_bytes {
        return Err(ValidationError::FileTooLarge {
            path: path.display().to_string(),
            size: meta.len(),
            max: max_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_task_id("task_123").is_ok());
        assert!(validate_task_id("1234").is_ok());
        assert!(validate_agent_name("my-agent").is_ok());
        assert!(validate_agent_name("Vaela_2").is_ok());
    }

    #[test]
    fn test_identifier_length_bounds() {
        let max = "a".repeat(64);
        assert!(validate_task_id(&max).is_ok());
        let too_long = "a".repeat(65);
        assert!(matches!(
            validate_task_id(&too_long),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_empty_identifier_rejected() {
        assert!(matches!(
            validate_task_id(""),
            Err(ValidationError::Empty("task_id"))
        ));
    }

    #[test]
    fn test_traversal_and_metacharacters_rejected() {
        for bad in [
            "../../etc/passwd",
            "a/b",
            "task;rm -rf /",
            "task id",
            "task$",
            "task`id`",
            "task\0id",
            "task|id",
            "task&id",
        ] {
            assert!(validate_task_id(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_hostname() {
        assert!(validate_hostname("example-01.internal").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("bad host").is_err());
        assert!(validate_hostname(&"h".repeat(254)).is_err());
    }

    #[test]
    fn test_recipe_path_valid() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dev.yaml"), "recipe: dev").unwrap();

        let resolved = validate_recipe_path("dev.yaml", dir.path()).unwrap();
        assert!(resolved.ends_with("dev.yaml"));
        assert!(resolved.is_absolute());
    }

    #[test]
    fn test_recipe_path_subdirectory() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("team")).unwrap();
        fs::write(dir.path().join("team").join("qa.yml"), "recipe: qa").unwrap();

        assert!(validate_recipe_path("team/qa.yml", dir.path()).is_ok());
    }

    #[test]
    fn test_recipe_path_rejections() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dev.yaml"), "x").unwrap();

        assert!(matches!(
            validate_recipe_path("/etc/passwd.yaml", dir.path()),
            Err(ValidationError::AbsolutePath(_))
        ));
        assert!(matches!(
            validate_recipe_path("../dev.yaml", dir.path()),
            Err(ValidationError::ParentRef(_))
        ));
        assert!(matches!(
            validate_recipe_path("dev.json", dir.path()),
            Err(ValidationError::BadExtension(_))
        ));
        assert!(matches!(
            validate_recipe_path("dev;rm.yaml", dir.path()),
            Err(ValidationError::InvalidPathChars(_))
        ));
        assert!(matches!(
            validate_recipe_path("dev\0.yaml", dir.path()),
            Err(ValidationError::InvalidPathChars(_))
        ));
    }

    #[test]
    fn test_recipe_path_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            validate_recipe_path("absent.yaml", dir.path()),
            Err(ValidationError::Unresolvable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_recipe_symlink_escape_rejected() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.yaml"), "x").unwrap();

        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.yaml"),
            dir.path().join("link.yaml"),
        )
        .unwrap();

        assert!(matches!(
            validate_recipe_path("link.yaml", dir.path()),
            Err(ValidationError::PathEscape { .. })
        ));
    }

    #[test]
    fn test_lease_path() {
        let dir = TempDir::new().unwrap();
        let path = validate_lease_path("1234", dir.path()).unwrap();
        assert!(path.ends_with("task_1234.json"));

        assert!(validate_lease_path("../evil", dir.path()).is_err());
        assert!(validate_lease_path("a/b", dir.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_lease_symlink_escape_rejected() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("target.json"), "{}").unwrap();

        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("target.json"),
            dir.path().join("task_evil.json"),
        )
        .unwrap();

        assert!(matches!(
            validate_lease_path("evil", dir.path()),
            Err(ValidationError::PathEscape { .. })
        ));
    }

    #[test]
    fn test_json_file_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.json");
        fs::write(&path, "[]").unwrap();
        assert!(validate_json_file_size(&path, 1024).is_ok());
        assert!(matches!(
            validate_json_file_size(&path, 1),
            Err(ValidationError::FileTooLarge { .. })
        ));
    }
}
