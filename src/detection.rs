use crate::core::BuildSystem;
use std::path::{Path, PathBuf};
use tokio::fs;

const MAKEFILE_NAMES: [&str; 3] = ["Makefile", "makefile", "GNUmakefile"];

/// Detect which build manifest a project directory carries. Make wins over
/// CMake when both are present.
pub async fn detect_build_system(path: &Path) -> Option<BuildSystem> {
    manifest_path(path).await.map(|(system, _)| system)
}

pub async fn manifest_path(path: &Path) -> Option<(BuildSystem, PathBuf)> {
    for name in MAKEFILE_NAMES {
        let candidate = path.join(name);
        if is_file(&candidate).await {
            return Some((BuildSystem::Makefile, candidate));
        }
    }

    let cmake = path.join("CMakeLists.txt");
    if is_file(&cmake).await {
        return Some((BuildSystem::CMake, cmake));
    }

    None
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}
