//! TCP control and data server.
//!
//! Each accepted connection gets its own reader thread plus a writer thread
//! draining a bounded line queue. The most recent connection owns the data
//! stream; older sessions stay connected and keep answering commands.

pub mod protocol;
mod session;
#[cfg(test)]
mod tests;

use crate::audio::{Decimator, StreamController};
use anyhow::{Context, Result};
use session::Session;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;

pub struct Server {
    listener: TcpListener,
    controller: Arc<StreamController>,
    decimator: Arc<Decimator>,
}

impl Server {
    pub fn bind(
        addr: SocketAddr,
        controller: Arc<StreamController>,
        decimator: Arc<Decimator>,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to listen on {addr}"))?;
        Ok(Self {
            listener,
            controller,
            decimator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    /// Accept connections forever. Accept errors are logged and skipped.
    pub fn serve(self) -> Result<()> {
        tracing::info!("listening on {}", self.local_addr()?);
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!("failed to accept connection: {err}");
                    continue;
                }
            };
            let peer = match stream.peer_addr() {
                Ok(peer) => peer,
                Err(err) => {
                    tracing::warn!("dropping connection with no peer address: {err}");
                    continue;
                }
            };
            let session = Session::new(
                stream,
                peer,
                self.controller.clone(),
                self.decimator.clone(),
            );
            if let Err(err) = thread::Builder::new()
                .name(format!("session-{peer}"))
                .spawn(move || session.run())
            {
                tracing::error!("failed to spawn session for {peer}: {err}");
            }
        }
        Ok(())
    }
}
