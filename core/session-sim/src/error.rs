use idlesync_core::SyncError;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Unknown instance {name} (have tab-1 .. tab-{count})")]
    UnknownInstance { name: String, count: usize },

    #[error("At least one instance is required")]
    NoInstances,

    #[error("No state directory found; pass --state-dir")]
    NoStateDir,

    #[error("{0} config field(s) rejected")]
    ConfigRejected(usize),
}

pub type Result<T> = std::result::Result<T, SimError>;
