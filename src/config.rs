use std::path::PathBuf;

use anyhow::{Context, Result};

/// Where the save files live. Defaults under the platform config dir.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
}

impl Config {
    pub fn new(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("guildgames")
        });

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(Config { data_dir })
    }

    pub fn parrot_file(&self) -> PathBuf {
        self.data_dir.join("parrot.json")
    }

    pub fn steal_file(&self) -> PathBuf {
        self.data_dir.join("steal.json")
    }

    pub fn quiz_file(&self) -> PathBuf {
        self.data_dir.join("quiz.json")
    }

    pub fn bank_file(&self) -> PathBuf {
        self.data_dir.join("bank.json")
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_ID: AtomicU64 = AtomicU64::new(0);

    /// A config rooted in a unique temp directory.
    pub fn temp_config(label: &str) -> Config {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir()
            .join("guildgames-tests")
            .join(format!("{}-{}-{}", label, std::process::id(), id));
        std::fs::create_dir_all(&dir).unwrap();
        Config { data_dir: dir }
    }
}
