//! Client open options
//!
//! Options forwarded to the backend when a client connects to the audio
//! server. All fields are optional; `OpenOptions::default()` asks for a
//! plain connection to the default server.

use serde::{Deserialize, Serialize};

/// Options for [`Session::open_client`](crate::runtime::Session::open_client)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Do not start the audio server if it is not already running
    pub no_start_server: bool,

    /// Connect to a specific named server instead of the default one
    pub server_name: Option<String>,

    /// Session identity to resume, if the backend supports session management
    pub session_id: Option<String>,
}

impl OpenOptions {
    /// Options that never auto-start the server
    pub fn existing_server() -> Self {
        Self {
            no_start_server: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_allow_server_start() {
        let opts = OpenOptions::default();
        assert!(!opts.no_start_server);
        assert!(opts.server_name.is_none());
        assert!(opts.session_id.is_none());
    }

    #[test]
    fn existing_server_sets_flag() {
        assert!(OpenOptions::existing_server().no_start_server);
    }
}
