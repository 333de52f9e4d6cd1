use serde::{Deserialize, Serialize};

/// Written after a successful install.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub version: String,
    pub packages: Vec<String>,
    pub installed_at: String,
}

/// What `provision` settled on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub version: String,
    /// First preset the router accepted, in fallback order.
    pub preset: Option<String>,
    pub configs: Vec<std::path::PathBuf>,
}
