//! Client-side SCP engine.
//!
//! Every transfer runs one remote `scp` over a shared [`remote::Session`]:
//!
//! - [`upload::put_file`], [`upload::put_all`] and [`upload::put_all_exclude_root`] drive a remote
//!   `scp -t` (sink) with a local file or tree;
//! - [`download::get_file`] and [`download::get_all`] drive a remote `scp -f` (source) and
//!   materialize what it sends;
//! - [`dispatch::transfer`] picks one of the above from a path pair and, for downloads, stages
//!   into a temporary sibling so an existing destination is only replaced by a complete copy;
//! - [`batch::run`] runs the path pairs of an inventory node with bounded parallelism.
//!
//! Times are carried on `T` lines when the session preserves them, and applied to local entries
//! only after their content (or, for directories, their children) is complete.

pub mod batch;
pub mod dispatch;
pub mod download;
mod error;
mod link;
pub mod upload;

pub use dispatch::transfer;
pub use error::Error;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub directories_created: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            directories_created: self.directories_created + other.directories_created,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            directories created: {}\n",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.directories_created,
        )
    }
}
