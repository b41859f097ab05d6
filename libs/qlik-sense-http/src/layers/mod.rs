//! Tower layers composed around the repository connection.
//!
//! - [`UserAgentLayer`] - default `User-Agent` unless the auth strategy set one

mod user_agent;

pub use user_agent::{UserAgentLayer, UserAgentService};
