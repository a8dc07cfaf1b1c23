pub mod auth;
pub mod broadcaster;
pub mod config;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod limiter;
pub mod models;
pub mod preview;
pub mod registry;
pub mod selection;
pub mod server;
pub mod streaming;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::auth::TokenStore;
    pub use crate::broadcaster::Broadcaster;
    pub use crate::config::Config;
    pub use crate::engine::{SwarmEngine, TransferHandle, TransferSource, WebSeedEngine, WebSeedOptions};
    pub use crate::indexer::Indexer;
    pub use crate::models::{PushMessage, SessionSnapshot, SessionState};
    pub use crate::preview::{FfmpegGenerator, PreviewQueue};
    pub use crate::registry::SessionRegistry;
    pub use crate::server::{router, AppState};
}
