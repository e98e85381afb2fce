//! Materializing the input tree of an action into an exec dir.
//!
//! Files are hard links into the [Cache], directories matching the link
//! patterns are symlinks to whole trees in the cache, all other directories
//! are created for real.
use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use farmhand_castore::{cache::Cache, DirectoriesIndex, Digest, Node};
use parking_lot::Mutex;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    action::{Action, Command},
    output_directory::OutputDirectory,
};

mod error;
mod linked;
mod owner;

pub use self::error::{Error, Violation};
pub use self::linked::{compile_patterns, linked_directories};
pub use self::owner::{set_all_owner, Owner};

/// What an exec dir holds references on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecDirInputs {
    /// Cache keys of input files.
    pub files: Vec<String>,
    /// Digests of linked input directories.
    pub directories: Vec<Digest>,
}

pub struct ExecFileSystem {
    root: PathBuf,
    cache: Arc<dyn Cache>,
    owner: Option<Owner>,
    link_input_directories: bool,
    linked_input_directories: Vec<Regex>,
    allow_symlink_target_absolute: bool,
    exec_dirs: Mutex<HashMap<PathBuf, ExecDirInputs>>,
}

type Placement = JoinHandle<Result<(), Violation>>;

impl ExecFileSystem {
    pub fn new(root: PathBuf, cache: Arc<dyn Cache>) -> Self {
        Self {
            root,
            cache,
            owner: None,
            link_input_directories: false,
            linked_input_directories: vec![],
            allow_symlink_target_absolute: false,
            exec_dirs: Mutex::new(HashMap::new()),
        }
    }

    /// Link whole input directories whose path relative to the exec dir
    /// matches one of `patterns`, instead of populating them file by file.
    pub fn with_linked_input_directories<S: AsRef<str>>(
        mut self,
        patterns: &[S],
    ) -> Result<Self, regex::Error> {
        self.linked_input_directories = compile_patterns(patterns)?;
        self.link_input_directories = !self.linked_input_directories.is_empty();
        Ok(self)
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn allow_symlink_target_absolute(mut self, allow: bool) -> Self {
        self.allow_symlink_target_absolute = allow;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The references held by a materialized exec dir.
    pub fn exec_dir_inputs(&self, exec_dir: &Path) -> Option<ExecDirInputs> {
        self.exec_dirs.lock().get(exec_dir).cloned()
    }

    /// Materializes the input tree of `action` into `<root>/<operation_name>`
    /// and creates the directories its outputs need.
    ///
    /// On failure (or when `cancel` fires) every reference taken so far is
    /// released and the partial exec dir is removed.
    #[instrument(skip(self, index, action, command, cancel), err)]
    pub async fn create_exec_dir(
        &self,
        operation_name: &str,
        index: Arc<DirectoriesIndex>,
        action: &Action,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, Error> {
        let output_directory = OutputDirectory::from_command(command)?;

        let exec_dir = self.root.join(operation_name);
        self.destroy_exec_dir(&exec_dir).await?;
        tokio::fs::create_dir_all(&exec_dir).await?;

        let linked = if self.link_input_directories {
            linked_directories(
                &index,
                &action.input_root_digest,
                &self.linked_input_directories,
            )
        } else {
            HashSet::new()
        };

        trace!(operation_name, "walking exec tree");
        let walk = Walk {
            exec_dir: exec_dir.clone(),
            cache: self.cache.clone(),
            index: index.clone(),
            files: Default::default(),
            directories: Default::default(),
        };
        let (placements, mut violations, interrupted) = walk
            .spawn_placements(
                &action.input_root_digest,
                &output_directory,
                &linked,
                self.allow_symlink_target_absolute,
                cancel,
            )
            .await;

        let interrupted = wait_placements(placements, &mut violations, interrupted, cancel).await;

        let inputs = ExecDirInputs {
            files: std::mem::take(&mut *walk.files.lock()),
            directories: std::mem::take(&mut *walk.directories.lock()),
        };

        if interrupted || !violations.is_empty() {
            self.cache
                .decrement_references(&inputs.files, &inputs.directories);
            // a failed removal is logged, the caller gets the original error
            let _ = remove_dir(&exec_dir).await;

            if interrupted {
                return Err(Error::Interrupted);
            }
            return Err(Error::Violations {
                path: exec_dir,
                violations,
            });
        }

        self.exec_dirs.lock().insert(exec_dir.clone(), inputs);

        trace!(operation_name, "stamping output directories");
        if let Err(e) = output_directory.stamp(&exec_dir).await {
            let _ = self.destroy_exec_dir(&exec_dir).await;
            return Err(e.into());
        }

        if let Some(owner) = self.owner {
            let path = exec_dir.clone();
            let result = tokio::task::spawn_blocking(move || set_all_owner(&path, owner)).await;
            if let Err(e) = result.map_err(io::Error::from).and_then(|r| r) {
                let _ = self.destroy_exec_dir(&exec_dir).await;
                return Err(e.into());
            }
        }

        Ok(exec_dir)
    }

    /// Releases the references of an exec dir and removes it. Destroying an
    /// exec dir that doesn't exist is not an error.
    #[instrument(skip(self), err)]
    pub async fn destroy_exec_dir(&self, exec_dir: &Path) -> io::Result<()> {
        let inputs = self.exec_dirs.lock().remove(exec_dir);
        if let Some(inputs) = inputs {
            self.cache
                .decrement_references(&inputs.files, &inputs.directories);
        }

        remove_dir(exec_dir).await
    }
}

/// State shared between the tree walk and the placements it spawns.
struct Walk {
    exec_dir: PathBuf,
    cache: Arc<dyn Cache>,
    index: Arc<DirectoriesIndex>,
    files: Arc<Mutex<Vec<String>>>,
    directories: Arc<Mutex<Vec<Digest>>>,
}

impl Walk {
    /// Walks the input tree, creating real directories inline and spawning a
    /// placement for everything else. Returns the placements, violations
    /// found during the walk itself, and whether the walk was cut short by
    /// `cancel`.
    async fn spawn_placements(
        &self,
        root_digest: &Digest,
        output_directory: &OutputDirectory,
        linked: &HashSet<String>,
        allow_symlink_target_absolute: bool,
        cancel: &CancellationToken,
    ) -> (Vec<Placement>, Vec<Violation>, bool) {
        let mut placements = Vec::new();
        let mut violations = Vec::new();

        let mut stack: Vec<(Digest, String, Option<&OutputDirectory>)> =
            vec![(root_digest.clone(), String::new(), Some(output_directory))];

        while let Some((digest, path, output)) = stack.pop() {
            if cancel.is_cancelled() {
                return (placements, violations, true);
            }

            let directory = match self.index.get(&digest) {
                Some(directory) => directory,
                None if digest.is_empty() => continue,
                None => {
                    violations.push(Violation::MissingDirectory {
                        digest,
                        path: PathBuf::from(path),
                    });
                    continue;
                }
            };

            for (name, node) in directory.nodes() {
                let rel_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", path, name)
                };
                let exec_path = self.exec_dir.join(&rel_path);

                match node {
                    Node::Directory { digest } => {
                        let child_output = output.and_then(|output| output.child(name));
                        if child_output.is_none() && linked.contains(&rel_path) {
                            placements.push(self.link_directory(
                                digest.clone(),
                                rel_path,
                                exec_path,
                            ));
                            continue;
                        }

                        // must exist before anything below it is placed
                        if let Err(source) = tokio::fs::create_dir(&exec_path).await {
                            violations.push(Violation::Directory {
                                path: PathBuf::from(rel_path),
                                source,
                            });
                            continue;
                        }
                        stack.push((digest.clone(), rel_path, child_output));
                    }
                    Node::File { digest, executable } => {
                        placements.push(self.put_file(
                            digest.clone(),
                            *executable,
                            rel_path,
                            exec_path,
                        ));
                    }
                    Node::Symlink { target } => {
                        if !allow_symlink_target_absolute && target.starts_with('/') {
                            violations.push(Violation::AbsoluteSymlink {
                                path: PathBuf::from(rel_path),
                                target: target.clone(),
                            });
                            continue;
                        }

                        let target = target.clone();
                        placements.push(tokio::spawn(async move {
                            tokio::fs::symlink(&target, &exec_path)
                                .await
                                .map_err(|source| Violation::Symlink {
                                    path: PathBuf::from(rel_path),
                                    source,
                                })
                        }));
                    }
                }
            }
        }

        (placements, violations, false)
    }

    /// Places a file: empty files are created directly, everything else is
    /// hard-linked to its cache entry.
    fn put_file(
        &self,
        digest: Digest,
        executable: bool,
        rel_path: String,
        exec_path: PathBuf,
    ) -> Placement {
        let cache = self.cache.clone();
        let files = self.files.clone();

        tokio::spawn(async move {
            let result = async {
                if digest.is_empty() {
                    tokio::fs::File::create(&exec_path).await?;
                    return Ok(());
                }

                let key = cache.key(&digest, executable);
                let cache_path = cache.put(&digest, executable).await?;
                files.lock().push(key);
                tokio::fs::hard_link(&cache_path, &exec_path).await
            }
            .await;

            result.map_err(|source| Violation::Input {
                digest,
                path: PathBuf::from(rel_path),
                executable,
                source,
            })
        })
    }

    fn link_directory(&self, digest: Digest, rel_path: String, exec_path: PathBuf) -> Placement {
        let cache = self.cache.clone();
        let index = self.index.clone();
        let directories = self.directories.clone();

        tokio::spawn(async move {
            let result = async {
                let put = cache.put_directory(&digest, index).await?;
                directories.lock().push(digest.clone());
                if put.missed {
                    debug!(exec_path=?exec_path, digest=%digest, "created linked directory");
                }
                tokio::fs::symlink(&put.path, &exec_path).await
            }
            .await;

            result.map_err(|source| Violation::LinkedDirectory {
                digest,
                path: PathBuf::from(rel_path),
                source,
            })
        })
    }
}

/// Awaits every placement, collecting violations. Once `cancel` fires (or
/// the walk was already interrupted) the remaining placements are aborted
/// and drained. Returns whether the wait was interrupted.
async fn wait_placements(
    placements: Vec<Placement>,
    violations: &mut Vec<Violation>,
    mut interrupted: bool,
    cancel: &CancellationToken,
) -> bool {
    for mut placement in placements {
        let result = if interrupted {
            placement.abort();
            placement.await
        } else {
            tokio::select! {
                result = &mut placement => result,
                _ = cancel.cancelled() => {
                    interrupted = true;
                    placement.abort();
                    placement.await
                }
            }
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(violation)) => violations.push(violation),
            Err(e) if e.is_cancelled() => {}
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    interrupted
}

async fn remove_dir(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path=?path, err=%e, "failed to remove exec dir");
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests;
