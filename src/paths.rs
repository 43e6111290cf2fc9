use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};

/// Socket path for a config file: `COMPROC_SOCKET` wins, then the user's
/// runtime dir, then the system temp dir scoped by uid. The file name hashes
/// the canonical config path so independent projects get independent
/// daemons.
pub fn socket_path(config_path: &Path) -> PathBuf {
    if let Ok(path) = std::env::var("COMPROC_SOCKET") {
        return PathBuf::from(path);
    }

    if let Some(runtime_dir) = dirs::runtime_dir() {
        return runtime_dir.join(socket_file_name(config_path));
    }

    let uid = nix::unistd::Uid::current();
    std::env::temp_dir().join(format!("comproc-{uid}-{}", socket_file_name(config_path)))
}

fn socket_file_name(config_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    config_path.hash(&mut hasher);
    format!("comproc-{:012x}.sock", hasher.finish() & 0xffff_ffff_ffff)
}
