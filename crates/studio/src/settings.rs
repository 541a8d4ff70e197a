use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use scenecast_stream::Style;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "scenecast";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "scenecast.sqlite3";
pub const DEFAULT_SESSION_TITLE_MAX_CHARS: usize = 30;
pub const DEFAULT_FRAME_DELAY_MS: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudioSettings {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub default_style: Style,
    #[serde(default = "default_session_title_max_chars")]
    pub session_title_max_chars: usize,
    /// Pause between replayed frames.
    #[serde(default)]
    pub frame_delay_ms: u64,
}

impl Default for StudioSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            default_style: Style::default(),
            session_title_max_chars: DEFAULT_SESSION_TITLE_MAX_CHARS,
            frame_delay_ms: DEFAULT_FRAME_DELAY_MS,
        }
    }
}

impl StudioSettings {
    pub fn normalized(mut self) -> Self {
        self.database_path = if self.database_path.trim().is_empty() {
            default_database_path()
        } else {
            self.database_path.trim().to_string()
        };
        if self.session_title_max_chars == 0 {
            self.session_title_max_chars = DEFAULT_SESSION_TITLE_MAX_CHARS;
        }
        self
    }

    /// Cuts a topic down to a session title.
    pub fn session_title(&self, topic: &str) -> String {
        topic
            .trim()
            .chars()
            .take(self.session_title_max_chars)
            .collect()
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<StudioSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".scenecast"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<StudioSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: StudioSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> StudioSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
            return StudioSettings::default();
        }

        let figment = Figment::from(Serialized::defaults(StudioSettings::default()))
            .merge(Json::file(path));

        match figment.extract::<StudioSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                StudioSettings::default()
            }
        }
    }

    fn persist(&self, settings: &StudioSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_path() -> String {
    SettingsStore::default_config_dir()
        .join(DATABASE_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

fn default_session_title_max_chars() -> usize {
    DEFAULT_SESSION_TITLE_MAX_CHARS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(directory.path().join("settings.json"));
        assert_eq!(*store.settings(), StudioSettings::default());
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("settings.json");
        std::fs::write(&path, r#"{"default_style": "camus", "frame_delay_ms": 25}"#).unwrap();

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.default_style, Style::Camus);
        assert_eq!(settings.frame_delay_ms, 25);
        assert_eq!(
            settings.session_title_max_chars,
            DEFAULT_SESSION_TITLE_MAX_CHARS
        );
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("settings.json");
        std::fs::write(&path, r#"{"default_style": "baroque"}"#).unwrap();

        assert_eq!(*SettingsStore::new(path).settings(), StudioSettings::default());
    }

    #[test]
    fn update_persists_normalized_settings() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());

        store
            .update(StudioSettings {
                database_path: "  ".to_string(),
                default_style: Style::Humor,
                session_title_max_chars: 0,
                frame_delay_ms: 5,
            })
            .unwrap();

        let reloaded = SettingsStore::new(path).settings();
        assert_eq!(reloaded.default_style, Style::Humor);
        assert_eq!(reloaded.session_title_max_chars, DEFAULT_SESSION_TITLE_MAX_CHARS);
        assert_eq!(reloaded.database_path, default_database_path());
        assert_eq!(*store.settings(), *reloaded);
    }

    #[test]
    fn session_titles_are_truncated_by_characters() {
        let settings = StudioSettings {
            session_title_max_chars: 3,
            ..StudioSettings::default()
        };
        assert_eq!(settings.session_title("  测试一下  "), "测试一");
    }
}
