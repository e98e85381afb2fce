//! The parts of a remotely submitted action the worker needs to prepare its
//! execution.
use farmhand_castore::Digest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Digest of the [Command] to run.
    pub command_digest: Digest,
    /// Digest of the root [farmhand_castore::Directory] of all inputs.
    pub input_root_digest: Digest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub arguments: Vec<String>,
    pub environment_variables: Vec<EnvironmentVariable>,
    /// Output files, relative to the working directory.
    /// Ignored if `output_paths` is set.
    pub output_files: Vec<String>,
    /// Output directories, relative to the working directory.
    /// Ignored if `output_paths` is set.
    pub output_directories: Vec<String>,
    /// Outputs of any kind, relative to the working directory.
    pub output_paths: Vec<String>,
    /// Relative to the exec root, empty for the exec root itself.
    pub working_directory: String,
}

impl Command {
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment_variables
            .iter()
            .find(|var| var.name == name)
            .map(|var| var.value.as_str())
    }
}
