use std::env;
use tokio::runtime::Handle;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::command::Charset;
use crate::Error;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:6379";

/// Connection settings.
///
/// Environment overrides read by [`Config::from_env`]:
/// * `RUSTDIS_ADDRESS`: server address, `host:port`.
/// * `RUSTDIS_CHARSET`: `utf-8`, `iso-8859-1` or `us-ascii`.
/// * `MAX_FRAME_SIZE`: largest reply, in bytes, the connection buffers before giving up.
#[derive(Clone, Debug)]
pub struct Config {
    pub address: String,
    pub charset: Charset,
    pub max_frame_size: usize,
    runtime: Option<Handle>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            charset: Charset::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            runtime: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(address) = lookup("RUSTDIS_ADDRESS") {
            config.address = address;
        }
        if let Some(charset) = lookup("RUSTDIS_CHARSET") {
            config.charset = charset
                .parse()
                .map_err(|_| format!("RUSTDIS_CHARSET: unsupported charset {:?}", charset))?;
        }
        if let Some(size) = lookup("MAX_FRAME_SIZE") {
            config.max_frame_size = size
                .parse()
                .map_err(|_| format!("MAX_FRAME_SIZE must be a number, got {:?}", size))?;
        }

        Ok(config)
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Runtime for the connection task and listener callbacks. Defaults to the runtime the client
    /// is created on.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub(crate) fn runtime_handle(&self) -> Handle {
        self.runtime.clone().unwrap_or_else(Handle::current)
    }
}
