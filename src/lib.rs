//! # ALFA Photos Sync
//!
//! Client core for an end-to-end encrypted photo backup service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ALFA PHOTOS SYNC                      │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │ KEY MANAGER │  │  ENVELOPE   │  │ SYNC RECONCILER │  │
//! │  │ X25519 +    │  │  CODEC      │  │ delta → index   │  │
//! │  │ Argon2 wrap │  │  XChaCha20  │  │ + downloads     │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬────────┘  │
//! │         │                │                   │           │
//! │  ┌──────┴────────────────┴───────────────────┴────────┐ │
//! │  │                    SYNC CONTEXT                     │ │
//! │  │   Store · Transport · EventSink · LocalFiles        │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Every file is sealed to the owner's X25519 public key
//! - Chunks are authenticated individually and bound to their position
//! - The private key leaves the device only wrapped under an Argon2id key
//! - The server only ever sees ciphertext and opaque names
//! - Key material is zeroized on drop and cleared on sign-out

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod events;
pub mod key_manager;
pub mod local_files;
pub mod model;
pub mod store;
pub mod sync;
pub mod thumbs;
pub mod transport;

pub use config::SyncConfig;
pub use envelope::{EnvelopeCodec, EnvelopeMeta, Header};
pub use error::{VaultError, VaultResult};
pub use events::{BroadcastEvents, EventSink, IndexChanges, SyncEvent};
pub use key_manager::{KeyBundle, KeyManager};
pub use local_files::{LocalFiles, Resolution};
pub use model::{AppInfo, Delta, FileRecord, FileSet, FileType, RecordKind};
pub use store::{SqliteStore, Store};
pub use sync::{ImportRequest, Session, SyncContext, SyncReport};
pub use thumbs::ThumbnailEngine;
pub use transport::{RetryPolicy, Transport};

/// ALFA Photos Sync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
