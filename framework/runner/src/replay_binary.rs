use std::env;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;

use crate::types::BlasterResult;

/// Environment variable to override the path to the tcpreplay binary.
pub const BLASTER_TCPREPLAY_PATH_ENV: &str = "BLASTER_TCPREPLAY_PATH";

const TCPREPLAY: &str = "tcpreplay";

/// Get the path to the tcpreplay binary.
///
/// If the [`BLASTER_TCPREPLAY_PATH_ENV`] environment variable is set, its value is used as the
/// path. Otherwise tcpreplay is looked up in the user's `PATH`, unless it is going to be run with
/// `sudo`, in which case the bare name is left for sudo to resolve with its own `PATH`.
pub fn tcpreplay_path(sudo: bool) -> BlasterResult<PathBuf> {
    match env::var(BLASTER_TCPREPLAY_PATH_ENV).ok().as_deref() {
        Some("") => {
            bail!("'{BLASTER_TCPREPLAY_PATH_ENV}' set to empty string");
        }
        Some(TCPREPLAY) | None if sudo => Ok(PathBuf::from(TCPREPLAY)),
        Some(TCPREPLAY) | None => {
            log::debug!("'{BLASTER_TCPREPLAY_PATH_ENV}' is not a path so looking in user's 'PATH'");
            which::which(TCPREPLAY).with_context(|| {
                format!(
                    "tcpreplay binary not found in PATH. Please install tcpreplay or set '{BLASTER_TCPREPLAY_PATH_ENV}' to the correct path."
                )
            })
        }
        Some(path) => {
            let tcpreplay_path = PathBuf::from(path);
            if !tcpreplay_path.exists() {
                bail!(
                    "Path to tcpreplay binary overwritten with '{BLASTER_TCPREPLAY_PATH_ENV}={path}' but that path doesn't exist",
                    path = tcpreplay_path.display()
                );
            }
            Ok(tcpreplay_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    #[serial]
    fn test_should_not_get_tcpreplay_path_if_not_exist() {
        env::set_var(BLASTER_TCPREPLAY_PATH_ENV, "/non/existent/path/to/tcpreplay");
        let result = tcpreplay_path(false);
        env::remove_var(BLASTER_TCPREPLAY_PATH_ENV);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_should_get_tcpreplay_path_from_env() {
        let temp = NamedTempFile::new().expect("failed to create temp file");
        let test_path = temp.path().to_str().expect("failed to get temp file path");
        env::set_var(BLASTER_TCPREPLAY_PATH_ENV, test_path);
        let result = tcpreplay_path(true).expect("failed to get tcpreplay path");
        env::remove_var(BLASTER_TCPREPLAY_PATH_ENV);
        assert_eq!(result, PathBuf::from(test_path));
    }

    #[test]
    #[serial]
    fn test_should_use_bare_name_with_sudo() {
        env::remove_var(BLASTER_TCPREPLAY_PATH_ENV);
        let result = tcpreplay_path(true).expect("bare name");
        assert_eq!(result, PathBuf::from("tcpreplay"));
    }
}
