//! Persisted settings.
//!
//! The core reads and writes exactly one setting: the port chain of the
//! device the user last selected. It lives in a small TOML file owned by the
//! embedding application; everything else the GUI persists is out of scope.

use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Port chain of the currently selected device; empty when none was
    /// ever selected.
    #[serde(default)]
    pub port_chain: String,
}

impl Settings {
    /// Loads settings, falling back to defaults when the file is missing or
    /// unreadable. A corrupt file is logged, not fatal — the device list is
    /// still discoverable without a remembered selection.
    pub fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!("ignoring malformed settings file {}: {err}", path.display());
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|err| Error::Settings(format!("serialize: {err}")))?;
        std::fs::write(path, text)
            .map_err(|err| Error::Settings(format!("write {}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");

        let settings = Settings { port_chain: "1-2.3".into() };
        settings.save(&path).expect("save");
        assert_eq!(Settings::load(&path), settings);
    }

    #[test]
    fn missing_or_malformed_files_yield_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        assert_eq!(Settings::load(&missing), Settings::default());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "port_chain = [not toml").unwrap();
        assert_eq!(Settings::load(&bad), Settings::default());
    }
}
