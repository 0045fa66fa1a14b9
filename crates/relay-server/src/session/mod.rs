pub mod id;
pub mod store;
pub mod token;

pub use store::{build_store, now_epoch_ms, DesktopRegistration, SessionStore};
pub use token::TokenIssuer;
