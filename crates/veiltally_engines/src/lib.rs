#![forbid(unsafe_code)]

pub mod emulated;
pub mod factory;
pub mod grant;
pub mod input;
pub mod key_store;
pub mod loader;
pub mod network;
pub mod probe;
pub mod session;
pub mod verifier;

pub use network::{NetworkClass, Transport};
pub use session::{EngineProvider, EngineSession, StructuredSigner};
