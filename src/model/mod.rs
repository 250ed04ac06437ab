pub mod auth;
pub mod connection;
pub mod forwarding;

pub use auth::AuthMethod;
pub use connection::SshConnection;
pub use forwarding::{ForwardConfig, ForwardingKind, ForwardingRule};
