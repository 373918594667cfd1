//! Action dispatch
//!
//! Maps a verb-plus-arguments request onto one locked protocol
//! operation: claim the port at full strength, drive a [`Session`],
//! and always hand the device back at the friendly prompt, whatever
//! the operation did.
//!
//! The dispatcher carries a working directory of its own. Relative
//! device paths are resolved against it, so callers can `chdir` once
//! and use short names afterwards.

use crate::arbiter::{Arbiter, LockStrength, require_open};
use crate::error::Result;
use replink_protocol::fs::{DEFAULT_CHUNK, DEFAULT_PUT_CHUNK};
use replink_protocol::{DirEntry, FileStat, Session};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// One request against the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Action {
    /// Print the device working directory
    Pwd,
    /// Human-readable listing
    Ls {
        /// Device directory, empty for the working directory
        path: String,
    },
    /// Structured listing
    Dir {
        /// Device directory, empty for the working directory
        path: String,
    },
    /// Print a device file
    Cat {
        /// Device path
        path: String,
    },
    /// Stat a device path
    Stat {
        /// Device path
        path: String,
    },
    /// Download a device file
    Get {
        /// Device path
        src: String,
        /// Local destination
        dst: PathBuf,
    },
    /// Upload a local file
    Put {
        /// Local source
        src: PathBuf,
        /// Device destination
        dst: String,
    },
    /// Copy a file on the device
    Cp {
        /// Device source
        src: String,
        /// Device destination
        dst: String,
    },
    /// Alias of `Cp`; the source is kept
    Mv {
        /// Device source
        src: String,
        /// Device destination
        dst: String,
    },
    /// Create a directory
    Mkdir {
        /// Device path
        path: String,
    },
    /// Remove an empty directory
    Rmdir {
        /// Device path
        path: String,
    },
    /// Remove a file
    Rm {
        /// Device path
        path: String,
    },
    /// Create an empty file
    Touch {
        /// Device path
        path: String,
    },
    /// Change the dispatcher working directory (and the device's)
    Chdir {
        /// Device path
        path: String,
    },
    /// Execute source text on the device
    Exec {
        /// Interpreter source
        code: String,
    },
    /// Execute a local script file on the device
    Run {
        /// Local script path
        path: PathBuf,
    },
}

impl Action {
    /// Build an action from a split command line, `None` for an unknown
    /// verb or wrong arity. `dir`/`mv` are the aliases callers expect.
    pub fn from_parts(verb: &str, args: &[&str]) -> Option<Self> {
        let arg = |i: usize| args.get(i).map(|s| s.to_string());
        let action = match (verb, args.len()) {
            ("pwd", 0) => Self::Pwd,
            ("ls", 0) => Self::Ls { path: String::new() },
            ("ls", 1) => Self::Ls { path: arg(0)? },
            ("dir", 0) => Self::Dir { path: String::new() },
            ("dir", 1) => Self::Dir { path: arg(0)? },
            ("cat" | "view", 1) => Self::Cat { path: arg(0)? },
            ("stat", 1) => Self::Stat { path: arg(0)? },
            ("get", 2) => Self::Get {
                src: arg(0)?,
                dst: PathBuf::from(arg(1)?),
            },
            ("put", 2) => Self::Put {
                src: PathBuf::from(arg(0)?),
                dst: arg(1)?,
            },
            ("cp", 2) => Self::Cp {
                src: arg(0)?,
                dst: arg(1)?,
            },
            ("mv", 2) => Self::Mv {
                src: arg(0)?,
                dst: arg(1)?,
            },
            ("mkdir", 1) => Self::Mkdir { path: arg(0)? },
            ("rmdir", 1) => Self::Rmdir { path: arg(0)? },
            ("rm", 1) => Self::Rm { path: arg(0)? },
            ("touch", 1) => Self::Touch { path: arg(0)? },
            ("cd" | "chdir", 1) => Self::Chdir { path: arg(0)? },
            ("exec", _) if !args.is_empty() => Self::Exec {
                code: args.join(" "),
            },
            ("run", 1) => Self::Run {
                path: PathBuf::from(arg(0)?),
            },
            _ => return None,
        };
        Some(action)
    }
}

/// What an action produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutput {
    /// Printable text (already decoded)
    Text {
        /// The text itself
        text: String,
    },
    /// A structured directory listing
    Listing {
        /// The entries, in device order
        entries: Vec<DirEntry>,
    },
    /// A stat result
    Stat {
        /// The stat fields
        stat: FileStat,
    },
    /// The action completed with nothing to show
    Done,
}

impl ActionOutput {
    fn text(bytes: Vec<u8>) -> Self {
        Self::Text {
            text: String::from_utf8_lossy(&bytes).to_string(),
        }
    }
}

/// Verb-level front end over one [`Arbiter`].
pub struct Dispatcher {
    arbiter: Arc<Arbiter>,
    workdir: String,
}

impl Dispatcher {
    /// Create a dispatcher with an empty working directory.
    pub fn new(arbiter: Arc<Arbiter>) -> Self {
        Self {
            arbiter,
            workdir: String::new(),
        }
    }

    /// The current working directory prefix
    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    /// Resolve a device path against the working directory. Absolute
    /// paths and an empty working directory pass through unchanged.
    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') || self.workdir.is_empty() {
            return path.to_string();
        }
        if path.is_empty() {
            return self.workdir.clone();
        }
        format!("{}/{}", self.workdir.trim_end_matches('/'), path)
    }

    /// Run one action under a full-strength port claim.
    ///
    /// The device is returned to the friendly prompt afterwards even
    /// when the action fails, so subscribers see a usable REPL again.
    pub async fn dispatch(&mut self, action: Action) -> Result<ActionOutput> {
        debug!(?action, "dispatching");
        let _lock = self.arbiter.lock(LockStrength::Full).await;
        let mut slot = self.arbiter.claim().await;
        let transport = require_open(&mut slot)?;

        let mut session = Session::new(transport);
        let result = self.run(&mut session, action).await;
        session.exit_raw_repl().await;
        result
    }

    async fn run(&mut self, session: &mut Session<'_>, action: Action) -> Result<ActionOutput> {
        let output = match action {
            Action::Pwd => ActionOutput::Text {
                text: session.fs_pwd().await?,
            },
            Action::Ls { path } => {
                let listing = session.fs_ls(&self.resolve(&path), None).await?;
                ActionOutput::text(listing)
            }
            Action::Dir { path } => ActionOutput::Listing {
                entries: session.fs_listdir(&self.resolve(&path)).await?,
            },
            Action::Cat { path } => {
                let contents = session
                    .fs_cat(&self.resolve(&path), DEFAULT_CHUNK, None)
                    .await?;
                ActionOutput::text(contents)
            }
            Action::Stat { path } => ActionOutput::Stat {
                stat: session.fs_stat(&self.resolve(&path)).await?,
            },
            Action::Get { src, dst } => {
                session
                    .fs_get(&self.resolve(&src), &dst, DEFAULT_CHUNK, None)
                    .await?;
                ActionOutput::Done
            }
            Action::Put { src, dst } => {
                session
                    .fs_put(&src, &self.resolve(&dst), DEFAULT_PUT_CHUNK, None)
                    .await?;
                ActionOutput::Done
            }
            Action::Cp { src, dst } | Action::Mv { src, dst } => {
                session
                    .fs_cp(&self.resolve(&src), &self.resolve(&dst), DEFAULT_CHUNK, None)
                    .await?;
                ActionOutput::Done
            }
            Action::Mkdir { path } => {
                session.fs_mkdir(&self.resolve(&path)).await?;
                ActionOutput::Done
            }
            Action::Rmdir { path } => {
                session.fs_rmdir(&self.resolve(&path)).await?;
                ActionOutput::Done
            }
            Action::Rm { path } => {
                session.fs_rm(&self.resolve(&path)).await?;
                ActionOutput::Done
            }
            Action::Touch { path } => {
                session.fs_touch(&self.resolve(&path)).await?;
                ActionOutput::Done
            }
            Action::Chdir { path } => {
                let resolved = self.resolve(&path);
                session.fs_chdir(&resolved).await?;
                self.workdir = resolved.clone();
                ActionOutput::Text { text: resolved }
            }
            Action::Exec { code } => {
                let output = session.exec(code.as_bytes(), None).await?;
                ActionOutput::text(output.stdout)
            }
            Action::Run { path } => {
                let source = tokio::fs::read(&path).await?;
                let output = session.exec(&source, None).await?;
                ActionOutput::text(output.stdout)
            }
        };
        Ok(output)
    }
}
