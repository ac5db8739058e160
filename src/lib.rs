//! rclonepool: present a set of rclone remotes as one storage pool.
//!
//! Files are split into fixed-size chunks, each chunk lands on one remote
//! according to a balancing policy, and a per-file manifest (replicated to
//! every remote) records the layout. The pool is served over WebDAV with
//! Range support so media players can seek without fetching whole files.

pub mod balance;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod dav;
pub mod error;
pub mod manifest;
pub mod pool;
pub mod transport;
