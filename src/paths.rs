use std::path::{Path, PathBuf};

/// Config file looked up when `--config` is not given.
pub const DEFAULT_CONFIG: &str = "scratchvm.toml";

/// Per-user state directory: `~/.local/share/scratchvm/` (or the platform equivalent).
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("scratchvm")
}

/// Run log directory: `<data_dir>/logs/`
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Default result record directory: `<data_dir>/results/`
pub fn results_dir() -> PathBuf {
    data_dir().join("results")
}

/// Scratch space for generated answer files.
pub fn work_dir() -> PathBuf {
    data_dir().join("work")
}

/// Path of the generated installer answer file for a VM.
pub fn answer_file_path(work_dir: &Path, vm_name: &str) -> PathBuf {
    work_dir.join(format!("{vm_name}.answers"))
}

/// Downloaded install media cache: `~/.cache/scratchvm/iso/`
pub fn iso_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("scratchvm")
        .join("iso")
}

/// Where caller-managed SSH keys live: `~/.ssh/`
pub fn ssh_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".ssh")
}

/// UTM's sandboxed documents directory holding `<name>.utm` bundles.
pub fn utm_documents_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("Library/Containers/com.utmapp.UTM/Data/Documents")
}

/// The persisted configuration document of a VM bundle.
pub fn vm_config_plist(documents: &Path, vm_name: &str) -> PathBuf {
    documents.join(format!("{vm_name}.utm")).join("config.plist")
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(rest),
        None => PathBuf::from(path),
    }
}
