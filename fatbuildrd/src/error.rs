//! Crate-wide error umbrella.
//!
//! Individual modules define their own `Error` enum with `snafu::Snafu` and
//! their own `Result<T>` alias (mirroring `tools/buildsys/src/builder.rs`'s
//! `error` submodule). This umbrella only exists at the boundary where a
//! single error type is required: a task's `run()` return value, and the
//! top-level `main.rs`.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(transparent)]
    Config { source: crate::config::Error },

    #[snafu(transparent)]
    Archive { source: crate::archive::Error },

    #[snafu(transparent)]
    Artifacts { source: crate::artifacts::Error },

    #[snafu(transparent)]
    Instances { source: crate::instances::Error },

    #[snafu(transparent)]
    Keyring { source: crate::keyring::Error },

    #[snafu(transparent)]
    Tokens { source: crate::tokens::Error },

    #[snafu(transparent)]
    Policy { source: crate::policy::Error },

    #[snafu(transparent)]
    Images { source: crate::images::Error },

    #[snafu(transparent)]
    Containers { source: crate::containers::Error },

    #[snafu(transparent)]
    Git { source: crate::git::Error },

    #[snafu(transparent)]
    Registry { source: crate::registry::Error },

    #[snafu(transparent)]
    Tasks { source: crate::tasks::Error },

    #[snafu(transparent)]
    Builds { source: crate::builds::Error },

    #[snafu(transparent)]
    Console { source: crate::console::Error },

    #[snafu(transparent)]
    Patches { source: crate::patches::Error },

    #[snafu(transparent)]
    Pipelines { source: crate::pipelines::Error },

    #[snafu(display("runtime error: {message}"))]
    Runtime { message: String },

    #[snafu(display("I/O error at {path:?}: {source}"))]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime {
            message: message.into(),
        }
    }
}
