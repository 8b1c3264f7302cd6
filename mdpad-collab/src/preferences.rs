//! Persisted display preferences: name, hue and theme.
//!
//! A first run picks a random name and hue and saves them, so a participant
//! keeps the same identity across sessions.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use log::{debug, info};
use mdpad_core::{UserProfile, HUE_RANGE};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const NAMES: &[&str] = &[
    "Abba", "Blondie", "Can", "Devo", "Elbow", "Feist", "Garbage", "Hole", "Interpol", "Journey",
    "Kraftwerk", "Low", "Muse", "Nirvana", "Oasis", "Pixies", "Queen", "Ramones", "Suede",
    "Television", "Ultravox", "Van Halen", "Weezer", "Yes",
];

#[derive(Error, Debug)]
pub enum PreferencesError {
    #[error("preferences I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("preferences file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no home directory to store preferences in")]
    NoHome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub name: String,
    pub hue: u16,
    #[serde(default)]
    pub dark_mode: bool,
}

impl UserPreferences {
    /// Random name and hue.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let name = NAMES.choose(&mut rng).copied().unwrap_or("Anonymous");
        Self {
            name: name.to_owned(),
            hue: rng.gen_range(0..HUE_RANGE),
            dark_mode: false,
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile::new(self.name.clone(), self.hue % HUE_RANGE)
    }
}

/// Somewhere preferences can be loaded from and saved to.
pub trait PreferencesStore: Send + Sync {
    fn load(&self) -> Result<Option<UserPreferences>, PreferencesError>;

    fn save(&self, prefs: &UserPreferences) -> Result<(), PreferencesError>;

    /// Load saved preferences, or generate and save new ones.
    fn load_or_init(&self) -> Result<UserPreferences, PreferencesError> {
        if let Some(prefs) = self.load()? {
            return Ok(prefs);
        }
        let prefs = UserPreferences::generate();
        self.save(&prefs)?;
        info!("Generated identity {} (hue {})", prefs.name, prefs.hue);
        Ok(prefs)
    }
}

/// Preferences stored as a JSON file.
#[derive(Debug, Clone)]
pub struct FilePreferences {
    path: PathBuf,
}

impl FilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `preferences.json` in the platform config directory.
    pub fn default_location() -> Result<Self, PreferencesError> {
        let dirs = ProjectDirs::from("dev", "mdpad", "mdpad").ok_or(PreferencesError::NoHome)?;
        Ok(Self::new(dirs.config_dir().join("preferences.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferencesStore for FilePreferences {
    fn load(&self) -> Result<Option<UserPreferences>, PreferencesError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No preferences at {}", self.path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, prefs: &UserPreferences) -> Result<(), PreferencesError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(prefs)?)?;
        Ok(())
    }
}

/// Preferences that live only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    inner: Mutex<Option<UserPreferences>>,
}

impl PreferencesStore for MemoryPreferences {
    fn load(&self) -> Result<Option<UserPreferences>, PreferencesError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, prefs: &UserPreferences) -> Result<(), PreferencesError> {
        *self.inner.lock() = Some(prefs.clone());
        Ok(())
    }
}
