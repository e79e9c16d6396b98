use std::path::PathBuf;

use crate::domain::{AppConfig, DomainError};

/// Port for persisting dictation settings (preferred microphone, model, ...).
pub trait ConfigStore: Send + Sync {
    /// Load the configuration, writing defaults first if none exists.
    fn load(&self) -> Result<AppConfig, DomainError>;

    fn save(&self, config: &AppConfig) -> Result<(), DomainError>;

    /// Load, modify and save in one step.
    fn update(&self, change: &dyn Fn(&mut AppConfig)) -> Result<AppConfig, DomainError> {
        let mut config = self.load()?;
        change(&mut config);
        self.save(&config)?;
        Ok(config)
    }

    fn config_path(&self) -> PathBuf;

    fn logs_dir(&self) -> PathBuf;
}
