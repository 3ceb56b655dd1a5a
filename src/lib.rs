#![deny(missing_docs)]
//! A multithreaded, in-memory key-value store (kvs) that maps [`String`] keys to [`String`]
//! values, served to local clients over named pipes (FIFOs).
//!
//! This crate provides the [`KvStore`] engine, the [`KvsServer`] and [`KvsClient`] that speak
//! the pipe protocol, the job worker pool that feeds the store from job files, and the
//! [`kvs-server`] and [`kvs-client`] executables.
//!
//! ## Supported Storage Operations
//! Job files drive the store with batch commands:
//!
//! - `WRITE [(k,v)(k2,v2)]` sets every pair
//! - `READ [k,k2]` prints `[(k,v)(k2,KVSERROR)]`
//! - `DELETE [k,k2]` removes every key, printing the ones that were missing
//! - `SHOW` prints every entry
//! - `WAIT <ms>` pauses the job
//! - `BACKUP` writes a snapshot of the store to `<job>-<n>.bck`
//!
//! Each batch is applied atomically with respect to concurrent readers. See the
//! [`command`] module for the job file format and the [`KvsEngine`] trait for the
//! operations themselves.
//!
//! ## Sessions and Subscriptions
//! A client registers three pipes (requests, responses, notifications) with the server. The
//! server admits at most `max_sessions` clients at once; further registrations wait for a free
//! slot. A client can subscribe to existing keys and is then sent a `(key,value)` notification
//! every time a job writes or deletes one of them. See the [`protocol`] module for the frame
//! layouts.
//!
//! ## Backups
//! At most `max_backups` snapshots run at the same time, each on a thread of the backup
//! [`ThreadPool`] so that a failing snapshot never takes the store down with it.
//!
//! [`String`]: https://doc.rust-lang.org/std/string/struct.String.html
//! [`kvs-server`]: ./kvs-server.rs
//! [`kvs-client`]: ./kvs-client.rs

pub use backup::{backup_path, BackupController};
pub use client::{KvsClient, Notifications};
pub use config::ServerConfig;
pub use engine::{KvStore, KvsEngine};
pub use error::{KvsError, Result};
pub use jobs::{JobQueue, JobRunner, JobWorkerPool};
pub use pubsub::{Notify, SubscriptionTable};
pub use server::{KvsServer, ServerHandle};
pub use session::{SessionRegistry, SessionState};
pub use thread_pool::{RayonThreadPool, SharedQueueThreadPool, ThreadPool};

mod backup;
mod client;
pub mod command;
pub mod config;
pub mod engine;
mod error;
pub mod jobs;
pub mod pipe;
pub mod protocol;
pub mod pubsub;
mod server;
pub mod session;
pub mod sync;
pub mod thread_pool;
