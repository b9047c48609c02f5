pub mod federated;
pub mod mfa;
pub mod registration;
pub mod session;

pub use federated::*;
pub use mfa::*;
pub use registration::*;
pub use session::*;
