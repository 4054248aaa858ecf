// Inventory & tool-configuration materializer
//
// Every regeneration produces a complete generation directory next to the
// previous ones and then repoints the `current` symlink with a rename, so a
// reader that resolved `current` keeps a consistent file set.

use std::fs;
use std::io::Write;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::rendered::{parse_rendered_file, render_inventory};
use super::InventorySnapshot;
use crate::output::errors::OpsError;
use crate::tasks::{ConfigAccess, ConfigWriteGuard};

pub const INVENTORY_FILE: &str = "hosts.yml";
pub const TOOL_CONFIG_FILE: &str = "ansible.cfg";
pub const GENERATION_FILE: &str = "generation.json";

const CURRENT_LINK: &str = "current";
const GENERATION_PREFIX: &str = "gen-";

/// Metadata of one rendered file set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub number: u64,
    pub fingerprint: String,
    pub host_count: usize,
    pub rendered_at: DateTime<Utc>,
    #[serde(skip)]
    dir: PathBuf,
}

impl Generation {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.dir.join(INVENTORY_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(TOOL_CONFIG_FILE)
    }
}

/// Renders inventory and tool configuration under a state directory
#[derive(Debug, Clone)]
pub struct InventoryMaterializer {
    root: PathBuf,
    keep_generations: usize,
    forks: usize,
}

impl InventoryMaterializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        InventoryMaterializer {
            root: root.into(),
            keep_generations: 3,
            forks: 10,
        }
    }

    pub fn with_keep_generations(mut self, keep: usize) -> Self {
        self.keep_generations = keep.max(1);
        self
    }

    pub fn with_forks(mut self, forks: usize) -> Self {
        self.forks = forks.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Render `snapshot` as a new generation and make it current.
    ///
    /// On any failure the previously current generation is left as it was.
    pub fn regenerate(
        &self,
        snapshot: &InventorySnapshot,
        _guard: &ConfigWriteGuard,
    ) -> Result<Generation, OpsError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| OpsError::io(format!("Failed to create state directory: {}", e), &self.root))?;

        let number = self.latest_number()? + 1;
        let name = format!("{}{:06}", GENERATION_PREFIX, number);
        let final_dir = self.root.join(&name);

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .map_err(|e| OpsError::io(format!("Failed to create staging directory: {}", e), &self.root))?;

        let mut generation = Generation {
            number,
            fingerprint: snapshot.fingerprint(),
            host_count: snapshot.len(),
            rendered_at: Utc::now(),
            dir: final_dir.clone(),
        };

        let inventory = render_inventory(snapshot)?;
        write_synced(&staging.path().join(INVENTORY_FILE), inventory.as_bytes())?;
        write_synced(
            &staging.path().join(TOOL_CONFIG_FILE),
            self.render_tool_config(&generation).as_bytes(),
        )?;
        let metadata = serde_json::to_vec_pretty(&generation)
            .map_err(|e| OpsError::runtime(format!("Failed to serialize generation: {}", e)))?;
        write_synced(&staging.path().join(GENERATION_FILE), &metadata)?;

        fs::rename(staging.path(), &final_dir).map_err(|e| {
            OpsError::io(format!("Failed to publish generation {}: {}", number, e), &final_dir)
        })?;
        // Nothing left at the staging path; dropping is a no-op
        drop(staging);

        if let Err(e) = self.point_current_at(&name) {
            let _ = fs::remove_dir_all(&final_dir);
            return Err(e);
        }

        generation.dir = final_dir;
        info!(
            generation = number,
            hosts = generation.host_count,
            fingerprint = %&generation.fingerprint[..12],
            "rendered inventory"
        );

        self.prune(number);
        Ok(generation)
    }

    /// The current generation, if anything has been rendered
    pub fn current<G: ConfigAccess>(&self, _guard: &G) -> Result<Option<Generation>, OpsError> {
        let link = self.root.join(CURRENT_LINK);
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(OpsError::io(format!("Failed to resolve current generation: {}", e), link))
            }
        };

        let dir = self.root.join(target);
        let metadata_path = dir.join(GENERATION_FILE);
        let content = fs::read(&metadata_path).map_err(|e| {
            OpsError::io(format!("Failed to read generation metadata: {}", e), &metadata_path)
        })?;
        let mut generation: Generation = serde_json::from_slice(&content).map_err(|e| {
            OpsError::Inventory {
                message: format!("Corrupt generation metadata: {}", e),
                suggestion: Some("Re-render the inventory".to_string()),
            }
        })?;
        generation.dir = dir;
        Ok(Some(generation))
    }

    /// Hosts recorded in a generation's inventory file
    pub fn load_snapshot(&self, generation: &Generation) -> Result<InventorySnapshot, OpsError> {
        parse_rendered_file(&generation.inventory_path())
    }

    fn render_tool_config(&self, generation: &Generation) -> String {
        format!(
            "# Rendered by clusterops: generation {number}, fingerprint {fingerprint}\n\
             [defaults]\n\
             inventory = {inventory}\n\
             forks = {forks}\n\
             host_key_checking = False\n\
             retry_files_enabled = False\n\
             \n\
             [ssh_connection]\n\
             pipelining = True\n",
            number = generation.number,
            fingerprint = generation.fingerprint,
            inventory = generation.inventory_path().display(),
            forks = self.forks,
        )
    }

    fn point_current_at(&self, name: &str) -> Result<(), OpsError> {
        let staged_link = self
            .root
            .join(format!(".{}-{:08x}", CURRENT_LINK, rand::random::<u32>()));

        symlink(name, &staged_link)
            .map_err(|e| OpsError::io(format!("Failed to stage current link: {}", e), &staged_link))?;

        let link = self.root.join(CURRENT_LINK);
        if let Err(e) = fs::rename(&staged_link, &link) {
            let _ = fs::remove_file(&staged_link);
            return Err(OpsError::io(format!("Failed to swap current link: {}", e), link));
        }

        Ok(())
    }

    /// Existing generation directories, ascending by number
    fn generations(&self) -> Result<Vec<(u64, PathBuf)>, OpsError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(OpsError::io(format!("Failed to read state directory: {}", e), &self.root))
            }
        };

        let mut generations = Vec::new();
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(number) = name
                .to_str()
                .and_then(|n| n.strip_prefix(GENERATION_PREFIX))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            generations.push((number, entry.path()));
        }

        generations.sort_by_key(|(number, _)| *number);
        Ok(generations)
    }

    fn latest_number(&self) -> Result<u64, OpsError> {
        Ok(self.generations()?.last().map_or(0, |(number, _)| *number))
    }

    fn prune(&self, current: u64) {
        let Ok(generations) = self.generations() else {
            return;
        };

        let excess = generations.len().saturating_sub(self.keep_generations);
        for (number, path) in generations.into_iter().take(excess) {
            if number == current {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => debug!(generation = number, "pruned old generation"),
                Err(e) => warn!(generation = number, error = %e, "failed to prune generation"),
            }
        }
    }
}

fn write_synced(path: &Path, content: &[u8]) -> Result<(), OpsError> {
    let mut file = fs::File::create(path)
        .map_err(|e| OpsError::io(format!("Failed to create file: {}", e), path))?;
    file.write_all(content)
        .and_then(|_| file.sync_all())
        .map_err(|e| OpsError::io(format!("Failed to write file: {}", e), path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Host, HostRole};
    use crate::tasks::ConfigLock;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn snapshot(workers: usize) -> InventorySnapshot {
        let mut hosts = vec![Host::new("cp-1", HostRole::ControlPlane).with_address("10.0.0.1")];
        for i in 0..workers {
            hosts.push(
                Host::new(format!("wk-{}", i), HostRole::Worker)
                    .with_address(format!("10.0.1.{}", i)),
            );
        }
        InventorySnapshot::from_hosts(hosts)
    }

    #[tokio::test]
    async fn test_nothing_rendered_yet() {
        let dir = TempDir::new().unwrap();
        let materializer = InventoryMaterializer::new(dir.path().join("state"));
        let guard = ConfigLock::new().read().await;

        assert!(materializer.current(&guard).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_regenerate_publishes_generation() {
        let dir = TempDir::new().unwrap();
        let materializer = InventoryMaterializer::new(dir.path());
        let guard = ConfigLock::new().write().await;

        let generation = materializer.regenerate(&snapshot(2), &guard).unwrap();
        assert_eq!(generation.number, 1);
        assert!(generation.inventory_path().exists());

        let config = fs::read_to_string(generation.config_path()).unwrap();
        assert!(config.contains(&format!(
            "inventory = {}",
            generation.inventory_path().display()
        )));

        let current = materializer.current(&guard).unwrap().unwrap();
        assert_eq!(current, generation);
        assert_eq!(materializer.load_snapshot(&current).unwrap(), snapshot(2));
    }

    #[tokio::test]
    async fn test_generations_advance_and_prune() {
        let dir = TempDir::new().unwrap();
        let materializer = InventoryMaterializer::new(dir.path()).with_keep_generations(2);
        let guard = ConfigLock::new().write().await;

        for workers in 0..4 {
            materializer.regenerate(&snapshot(workers), &guard).unwrap();
        }

        let current = materializer.current(&guard).unwrap().unwrap();
        assert_eq!(current.number, 4);
        assert_eq!(current.host_count, 4);

        let numbers: Vec<u64> = materializer
            .generations()
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(numbers, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_previous_generation() {
        let dir = TempDir::new().unwrap();
        let materializer = InventoryMaterializer::new(dir.path());
        let guard = ConfigLock::new().write().await;

        let first = materializer.regenerate(&snapshot(1), &guard).unwrap();
        let before = fs::read_to_string(first.inventory_path()).unwrap();

        // A plain file squatting on the next generation name blocks the rename
        fs::write(dir.path().join("gen-000002"), b"not a directory").unwrap();

        let result = materializer.regenerate(&snapshot(5), &guard);
        assert!(matches!(result, Err(OpsError::Io { .. })));

        let current = materializer.current(&guard).unwrap().unwrap();
        assert_eq!(current.number, 1);
        assert_eq!(fs::read_to_string(current.inventory_path()).unwrap(), before);

        // No staging leftovers
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
