use std::path::{Path, PathBuf};

/// Node settings in a saveable format. The relay and bootstrap addresses
/// belong to the deployment, so they live here rather than in constants.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct Settings {
    /// Multi-address of the static relay, including its `/p2p/` peer id.
    pub relay_address: String,

    /// Multi-addresses of the bootstrap peers; at least one must be
    /// reachable for login to succeed.
    pub bootstrap_addresses: Vec<String>,

    /// Path of the local RPC socket.
    pub socket_path: PathBuf,

    /// Path of the embedded database file.
    pub database_path: PathBuf,

    /// Directory that holds `fileshare/uploads` and `fileshare/downloads`.
    pub share_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_address: String::new(),
            bootstrap_addresses: Vec::new(),
            socket_path: PathBuf::from("orcanet_p2p.sock"),
            database_path: PathBuf::from("orcanet_p2p.db"),
            share_root: PathBuf::from("."),
        }
    }
}

impl Settings {
    /// Directory for files this node serves.
    #[must_use]
    pub fn uploads_dir(&self) -> PathBuf {
        self.share_root.join("fileshare").join("uploads")
    }

    /// Directory reserved for downloaded files.
    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.share_root.join("fileshare").join("downloads")
    }
}

/// Load the settings file, or create it with defaults so the operator has a
/// template to fill in.
pub fn load_settings(path: &Path) -> Result<Settings, std::io::Error> {
    if path.exists() {
        let settings = std::fs::read_to_string(path)?;
        serde_json::from_str::<Settings>(&settings).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse settings: {e}"),
            )
        })
    } else {
        let settings = Settings::default();
        save_settings(path, &settings)?;
        Ok(settings)
    }
}

/// Save the settings.
pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, settings)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_a_template() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("settings.json");

        let settings = load_settings(&path).expect("create default settings");
        assert!(path.exists());
        assert!(settings.relay_address.is_empty());

        // A second load reads the same file back.
        let reloaded = load_settings(&path).expect("reload settings");
        assert_eq!(reloaded.socket_path, settings.socket_path);
    }

    #[test]
    fn share_directories_nest_under_the_root() {
        let settings = Settings {
            share_root: PathBuf::from("/srv/orca"),
            ..Settings::default()
        };
        assert_eq!(
            settings.uploads_dir(),
            PathBuf::from("/srv/orca/fileshare/uploads")
        );
        assert_eq!(
            settings.downloads_dir(),
            PathBuf::from("/srv/orca/fileshare/downloads")
        );
    }
}
