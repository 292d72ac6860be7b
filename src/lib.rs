pub mod cli;
pub mod config;
pub mod gateway;
pub mod model;
pub mod realtime;
pub mod retry;
pub mod share;
pub mod storage;
pub mod store;
pub mod view;

#[cfg(test)]
mod test_support;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use gateway::{AccountProvider, GatewayError, NoteBackend, RemoteNotes, SessionAccount};
pub use model::{Note, NoteColor, NotePatch, NoteRow, SortMode};
pub use store::{Reconcile, StoreError, StoreOptions, SyncStore};
