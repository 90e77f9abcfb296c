//! Shared fixtures for the sshio integration tests
//!
//! Everything runs against the in-memory server from `sshio-transport`'s
//! `mock` feature.

#![allow(dead_code)]

use anyhow::Result;
use sshio::{Context, ResourceId, StreamWrapper, WrapperConfig};
use sshio_transport::MockTransport;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// A mock server with one account and a wrapper pointed at it
pub struct TestEnv {
    pub server: MockTransport,
    pub wrapper: StreamWrapper,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_server(MockTransport::new())
    }

    pub fn with_server(server: MockTransport) -> Self {
        Self::with_config(server, WrapperConfig::default()).expect("default config is valid")
    }

    pub fn with_config(server: MockTransport, config: WrapperConfig) -> Result<Self> {
        init_tracing();
        let server = server.with_account("deploy", "s3cret");
        let wrapper = StreamWrapper::with_config(Arc::new(server.clone()), config)?;
        Ok(Self { server, wrapper })
    }

    /// Context carrying the account's credentials
    pub fn login(&self) -> Context {
        Context::new().with_username("deploy").with_password("s3cret")
    }

    /// A registered, authenticated session
    pub fn session(&self) -> Result<ResourceId> {
        Ok(self.wrapper.connect("app.internal", 22, &self.login())?)
    }
}
