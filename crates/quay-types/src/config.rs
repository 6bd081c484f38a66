use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

const fn default_frame_channel() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PgConfig {
    #[serde(alias = "addr")]
    pub bind_addr: SocketAddr,

    /// Per-connection frame/response channel capacity.
    #[serde(default = "default_frame_channel")]
    pub frame_channel_size: usize,
}

impl PgConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            frame_channel_size: default_frame_channel(),
        }
    }
}
