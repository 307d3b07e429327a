use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".farm"))
            .unwrap_or_else(|| PathBuf::from(".farm"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base.join("cache")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.base.join("jobs")
    }

    /// Scratch directory handed to the executor for one hosted job.
    pub fn job_workspace(&self, job_guid: &uuid::Uuid) -> PathBuf {
        self.jobs_dir().join(job_guid.to_string())
    }

    pub fn local_socket(&self) -> PathBuf {
        self.base.join("agent.sock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.jobs_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
