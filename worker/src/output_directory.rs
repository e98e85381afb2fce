//! The skeleton of directories an action expects to exist before it runs,
//! derived from its declared outputs.
use std::{collections::BTreeMap, io, path::Path};
use tracing::instrument;

use crate::action::Command;

/// Environment variables naming directories the test runner collects
/// undeclared outputs from.
const UNDECLARED_OUTPUT_VARS: [&str; 2] = [
    "TEST_UNDECLARED_OUTPUTS_DIR",
    "TEST_UNDECLARED_OUTPUTS_ANNOTATIONS_DIR",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("output path {0:?} is absolute")]
    Absolute(String),

    #[error("output path {0:?} escapes the exec root")]
    EscapesRoot(String),
}

/// A tree of directory names. Everything below a declared output directory
/// belongs to the action.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutputDirectory {
    children: BTreeMap<String, OutputDirectory>,
    /// Set on declared output directories.
    recursive: bool,
}

static RECURSIVE: OutputDirectory = OutputDirectory {
    children: BTreeMap::new(),
    recursive: true,
};

impl OutputDirectory {
    /// Builds the skeleton for a command. `output_paths` take precedence over
    /// `output_files` and `output_directories`, and leave creating the path
    /// itself to the action.
    pub fn from_command(command: &Command) -> Result<Self, Error> {
        let (files, dirs): (&[String], &[String]) = if !command.output_paths.is_empty() {
            (&command.output_paths, &[])
        } else {
            (&command.output_files, &command.output_directories)
        };

        let prefixed = |path: &String| {
            if command.working_directory.is_empty() {
                path.clone()
            } else {
                format!("{}/{}", command.working_directory, path)
            }
        };

        let undeclared = UNDECLARED_OUTPUT_VARS
            .iter()
            .filter_map(|name| command.env(name))
            .map(str::to_string);

        Self::parse(
            files.iter().map(prefixed),
            dirs.iter().map(prefixed).chain(undeclared),
        )
    }

    /// Builds the skeleton from output files, for which only the parent
    /// directories are created, and output directories.
    pub fn parse(
        files: impl IntoIterator<Item = String>,
        dirs: impl IntoIterator<Item = String>,
    ) -> Result<Self, Error> {
        let mut root = OutputDirectory::default();

        for file in files {
            let mut components = components(&file)?;
            // the file itself is up to the action
            components.pop();
            root.insert(&components);
        }

        for dir in dirs {
            let components = components(&dir)?;
            root.insert(&components).recursive = true;
        }

        Ok(root)
    }

    fn insert(&mut self, components: &[&str]) -> &mut OutputDirectory {
        components.iter().fold(self, |node, name| {
            node.children.entry(name.to_string()).or_default()
        })
    }

    /// The skeleton below `name`, if any output lives beneath it.
    pub fn child(&self, name: &str) -> Option<&OutputDirectory> {
        if self.recursive {
            return Some(&RECURSIVE);
        }
        self.children.get(name)
    }

    /// Whether this is a declared output directory.
    pub fn is_output(&self) -> bool {
        self.recursive
    }

    /// Creates every directory of the skeleton below `root`.
    #[instrument(skip(self), err)]
    pub async fn stamp(&self, root: &Path) -> io::Result<()> {
        let mut stack = vec![(root.to_path_buf(), self)];

        while let Some((path, node)) = stack.pop() {
            tokio::fs::create_dir_all(&path).await?;
            for (name, child) in node.children.iter() {
                stack.push((path.join(name), child));
            }
        }

        Ok(())
    }
}

/// Splits a relative output path into its normal components.
fn components(path: &str) -> Result<Vec<&str>, Error> {
    if path.starts_with('/') {
        return Err(Error::Absolute(path.to_string()));
    }

    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => return Err(Error::EscapesRoot(path.to_string())),
            name => components.push(name),
        }
    }
    Ok(components)
}
