//! Run a remote command and copy its output to the terminal
//!
//! ```text
//! SSHIO_USER=deploy SSHIO_PASSWORD=... \
//!     SSHIO_URL='ssh2.exec://build.example.com/usr/bin/uptime' \
//!     cargo run --example remote_exec
//! ```
//!
//! `SSHIO_KEY` may name a private key; the public key is expected next to it
//! with a `.pub` suffix.

use anyhow::{bail, Context as _, Result};
use sshio::transport::Libssh2Transport;
use sshio::{Context, StreamWrapper};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let url = match std::env::var("SSHIO_URL") {
        Ok(url) => url,
        Err(_) => bail!("SSHIO_URL must name an identifier such as ssh2.exec://host/usr/bin/uptime"),
    };

    let mut context = Context::new();
    if let Ok(user) = std::env::var("SSHIO_USER") {
        context = context.with_username(user);
    }
    if let Ok(password) = std::env::var("SSHIO_PASSWORD") {
        context = context.with_password(password);
    }
    if let Some(key) = std::env::var_os("SSHIO_KEY").map(PathBuf::from) {
        let mut public = key.clone().into_os_string();
        public.push(".pub");
        context = context.with_key_pair(PathBuf::from(public), key);
    }

    let wrapper = StreamWrapper::new(Arc::new(Libssh2Transport));
    let mut stream = wrapper
        .open(&url, "r", &context)
        .with_context(|| format!("opening {}", url))?;
    stream.set_blocking(true);

    let mut stdout = io::stdout().lock();
    let copied = io::copy(&mut stream, &mut stdout)?;
    stdout.flush()?;

    info!(bytes = copied, exit_status = ?stream.exit_status(), "command finished");
    Ok(())
}
