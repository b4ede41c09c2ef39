//! stash-client: the client half of the secret-sync protocol
//!
//! Fields are sealed with the session storage key before they leave the
//! process; the server only ever stores ciphertext envelopes.

pub mod session;
pub mod sync;

pub use session::{PlainRecord, Session};
pub use sync::{connect, SyncClient};
