use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from sysreg.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub vm: VmConfig,
    pub serial: SerialConfig,
    pub monitor: MonitorConfig,
    pub retry: RetryConfig,
    pub transcript: TranscriptConfig,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VmConfig {
    pub name: String,
    /// Directory the VM and its disk are created in.
    pub base_folder: PathBuf,
    pub os_type: String,
    pub memory_mb: u32,
    pub vram_mb: u32,
    /// `startvm --type` value: "headless", "gui" or "sdl".
    pub frontend: String,
    pub storage_controller: String,
    pub disk_file: PathBuf,
    pub disk_size_mb: u64,
    /// Delete and recreate the boot disk before the first stage.
    pub fresh_disk: bool,
    pub vboxmanage: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    pub socket_path: PathBuf,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Inactivity timeout per boot attempt.
    pub timeout_secs: u64,
    /// Identical consecutive chunks tolerated before an attempt counts as stuck.
    pub duplicate_line_limit: u32,
    pub chunk_capacity: usize,
    /// Echo guest output to stdout.
    pub echo: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Boot attempts allowed per stage.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TranscriptConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageConfig {
    pub checkpoint: String,
}

// --- Default implementations ---

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            vm: VmConfig::default(),
            serial: SerialConfig::default(),
            monitor: MonitorConfig::default(),
            retry: RetryConfig::default(),
            transcript: TranscriptConfig::default(),
            stages: default_stages(),
        }
    }
}

/// Checkpoints of the three-boot ReactOS test: two setup boots, then the
/// test run. The first two markers are the same string.
fn default_stages() -> Vec<StageConfig> {
    [
        "It's the final countdown...",
        "It's the final countdown...",
        "SYSREG_CHECKPOINT:THIRDBOOT_COMPLETE",
    ]
    .into_iter()
    .map(|checkpoint| StageConfig {
        checkpoint: checkpoint.to_string(),
    })
    .collect()
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "ReactOS Testbot".to_string(),
            base_folder: PathBuf::from("vm"),
            os_type: "Windows2003".to_string(),
            memory_mb: 256,
            vram_mb: 16,
            frontend: "headless".to_string(),
            storage_controller: "sata0".to_string(),
            disk_file: PathBuf::from("ReactOS Testbot.vdi"),
            disk_size_mb: 2048,
            fresh_disk: true,
            vboxmanage: PathBuf::from("VBoxManage"),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/reactos-testbot.sock"),
            connect_timeout_secs: 3,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            duplicate_line_limit: 1000,
            chunk_capacity: crate::chunk::CHUNK_CAPACITY,
            echo: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 30 }
    }
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("testbot.txt"),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl HarnessConfig {
    /// Load config from `path`, or defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid("at least one stage is required".into()));
        }
        if let Some(i) = self.stages.iter().position(|s| s.checkpoint.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "stage {} has an empty checkpoint",
                i + 1
            )));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Invalid("retry.max_retries must be at least 1".into()));
        }
        if self.monitor.timeout_secs == 0 {
            return Err(ConfigError::Invalid("monitor.timeout_secs must be at least 1".into()));
        }
        let min_capacity = crate::markers::longest_prompt();
        if self.monitor.chunk_capacity < min_capacity {
            return Err(ConfigError::Invalid(format!(
                "monitor.chunk_capacity must be at least {min_capacity}"
            )));
        }
        Ok(())
    }

    /// Transcript path, if transcripts are enabled.
    pub fn transcript_path(&self) -> Option<&Path> {
        self.transcript
            .enabled
            .then_some(self.transcript.path.as_path())
    }
}
