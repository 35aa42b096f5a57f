use std::path::Path;
use log::{debug, warn};
use crate::config::defs::PipelineError;
use crate::pipelines::run::ScratchLayout;


/// A run's scratch tree. Removed by `remove`, or on drop when the run
/// future is abandoned before reaching it.
#[derive(Debug)]
pub struct ScratchDir {
    layout: ScratchLayout,
    removed: bool,
}

impl ScratchDir {
    /// Creates `<root>/{input,align,call}`. An existing root belongs to
    /// another run (or a crashed one) and is refused.
    pub async fn create(layout: &ScratchLayout) -> Result<Self, PipelineError> {
        if let Some(parent) = layout.root.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // create_dir is the claim: of two runs racing for one root, only one succeeds.
        match tokio::fs::create_dir(&layout.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(PipelineError::InvalidConfig(format!(
                    "Scratch directory {} already exists; remove it or pick another working directory",
                    layout.root.display()
                )));
            }
            Err(e) => return Err(e.into()),
        }
        // Owns the root from here on, so a failure below still cleans up.
        let scratch = Self { layout: layout.clone(), removed: false };
        for dir in [&layout.input, &layout.align, &layout.call] {
            tokio::fs::create_dir_all(dir).await?;
        }
        debug!("Created scratch directory {}", layout.root.display());
        Ok(scratch)
    }

    pub fn layout(&self) -> &ScratchLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    /// Deletes the whole tree. Best effort: a failure is logged, never raised.
    pub async fn remove(mut self) {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.layout.root).await {
            Ok(()) => debug!("Removed scratch directory {}", self.layout.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove scratch directory {}: {}", self.layout.root.display(), e),
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.layout.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove scratch directory {}: {}", self.layout.root.display(), e);
            }
        }
    }
}


/// Lists the regular files below `dir`, for diagnostics when a stage
/// reports success but an artifact is missing.
pub fn list_files(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let mut names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
        Err(_) => Vec::new(),
    }
}
