use std::path::PathBuf;

/// Platform-appropriate user-writable directory for image output: the home
/// directory, falling back to the working directory.
pub fn writeable_directory() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}
