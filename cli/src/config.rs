use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

pub struct Config {
    pub db_path: PathBuf,
    pub token_path: PathBuf,
    pub api_url: String,
}

impl Config {
    /// `api_url` comes from `--api-url`; falls back to `FITTRACK_API_URL`, then the default.
    pub fn load(api_url: Option<String>) -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "fittrack").context("Could not determine home directory")?;
        let api_url = api_url
            .or_else(|| std::env::var("FITTRACK_API_URL").ok())
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Self::in_dir(proj_dirs.data_dir(), api_url)
    }

    pub fn in_dir(data_dir: &Path, api_url: String) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Ok(Config {
            db_path: data_dir.join("fittrack.db"),
            token_path: data_dir.join("token"),
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Bearer token for the API, kept in memory and mirrored to a file.
///
/// `FITTRACK_TOKEN` takes precedence over the file when set.
pub struct TokenStore {
    path: PathBuf,
    token: RwLock<Option<String>>,
}

impl TokenStore {
    pub fn load(path: &Path) -> Result<Self> {
        let from_env = std::env::var("FITTRACK_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let token = match from_env {
            Some(token) => Some(token),
            None if path.exists() => {
                let raw = std::fs::read_to_string(path).context("Failed to read token file")?;
                Some(raw.trim().to_string()).filter(|t| !t.is_empty())
            }
            None => None,
        };

        Ok(Self::new(path.to_path_buf(), token))
    }

    pub fn new(path: PathBuf, token: Option<String>) -> Self {
        Self {
            path,
            token: RwLock::new(token),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    pub fn save(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("Token must not be empty");
        }
        std::fs::write(&self.path, token).context("Failed to write token file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set token file permissions")?;
        }
        if let Ok(mut slot) = self.token.write() {
            *slot = Some(token.to_string());
        }
        Ok(())
    }

    /// Forget the token. Returns whether one was stored.
    pub fn clear(&self) -> Result<bool> {
        let had_file = self.path.exists();
        if had_file {
            std::fs::remove_file(&self.path).context("Failed to remove token file")?;
        }
        let had_token = self.token.write().map(|mut t| t.take().is_some()).unwrap_or(false);
        Ok(had_file || had_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(&dir.path().join("nested"), "http://api.test/".into()).unwrap();
        assert!(dir.path().join("nested").exists());
        assert_eq!(config.db_path.file_name().unwrap(), "fittrack.db");
        assert_eq!(config.api_url, "http://api.test");
    }

    #[test]
    fn test_token_save_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let store = TokenStore::new(path.clone(), None);
        assert!(store.get().is_none());

        store.save("  abc123\n").unwrap();
        assert_eq!(store.get().as_deref(), Some("abc123"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abc123");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(store.clear().unwrap());
        assert!(store.get().is_none());
        assert!(!path.exists());
        assert!(!store.clear().unwrap());
    }

    #[test]
    fn test_empty_token_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token"), None);
        assert!(store.save("   ").is_err());
    }
}
