//! Named relays in one process
//!
//! Each configured source gets its own [`StreamRelay`](crate::relay::StreamRelay)
//! with its own listener. The registry looks them up by stream name:
//!
//! ```text
//!                    RelayRegistry
//!             ┌─────────────────────────┐
//!             │ relays: HashMap<name,   │
//!             │   StreamRelay {         │
//!             │     session,            │
//!             │     clients,            │
//!             │   }                     │
//!             │ >                       │
//!             └───────────┬─────────────┘
//!                         │
//!        ┌────────────────┼────────────────┐
//!        ▼                ▼                ▼
//!   "front-door"       "garage"         "yard"
//!    :9999              :9998            :9997
//! ```

pub mod error;
pub mod store;

pub use error::RegistryError;
pub use store::RelayRegistry;
