use super::protocol::{
    format_status, parse_command, read_frame, Command, Frame, ProtocolError, LINE_TERMINATOR,
};
use crate::audio::{Decimator, StreamController};
use crate::sink::{DataHandler, Outbound, SocketSink};
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Lines queued for one client before data lines start being dropped.
pub(super) const OUTBOUND_CAPACITY: usize = 256;
const WRITER_POLL: Duration = Duration::from_millis(250);

/// One connected client, from accept to close.
pub(super) struct Session {
    peer: SocketAddr,
    stream: TcpStream,
    controller: Arc<StreamController>,
    decimator: Arc<Decimator>,
}

impl Session {
    pub(super) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        controller: Arc<StreamController>,
        decimator: Arc<Decimator>,
    ) -> Self {
        Self {
            peer,
            stream,
            controller,
            decimator,
        }
    }

    /// Serve the connection until the peer goes away. Always stops the
    /// stream on the way out.
    pub(super) fn run(self) {
        let peer = self.peer;
        tracing::info!("client connected: {peer}");
        if let Err(err) = self.serve() {
            tracing::warn!("session {peer} ended with error: {err:#}");
        }
        self.controller.stop();
        let _ = self.stream.shutdown(Shutdown::Both);
        tracing::info!("client disconnected: {peer}");
    }

    fn serve(&self) -> Result<()> {
        let _ = self.stream.set_nodelay(true);
        let write_half = self
            .stream
            .try_clone()
            .context("failed to clone client socket")?;
        let read_half = self
            .stream
            .try_clone()
            .context("failed to clone client socket")?;

        let (tx, rx) = bounded(OUTBOUND_CAPACITY);
        let outbound = Outbound::new(tx);
        let closing = Arc::new(AtomicBool::new(false));
        let writer = spawn_writer(write_half, rx, closing.clone(), self.peer)?;

        self.controller.attach_sink(DataHandler::Socket(SocketSink::new(
            self.peer,
            outbound.clone(),
            self.decimator.clone(),
        )));

        let result = self.read_loop(read_half, &outbound);

        let dropped = outbound.dropped();
        if dropped > 0 {
            tracing::info!("{dropped} data line(s) to {} dropped on a full outbound queue", self.peer);
        }
        closing.store(true, Ordering::Release);
        drop(outbound);
        let _ = self.stream.shutdown(Shutdown::Write);
        let _ = writer.join();
        result
    }

    fn read_loop(&self, read_half: TcpStream, outbound: &Outbound) -> Result<()> {
        let mut reader = BufReader::new(read_half);
        let mut line = Vec::new();
        loop {
            match read_frame(&mut reader, &mut line).context("failed to read from client")? {
                Frame::Line => {
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| self.handle_line(&line, outbound)));
                    if outcome.is_err() {
                        tracing::error!("command from {} panicked; ignoring it", self.peer);
                    }
                }
                Frame::Closed => return Ok(()),
                Frame::Oversized => {
                    tracing::warn!(
                        "line from {} exceeds {} bytes; closing connection",
                        self.peer,
                        super::protocol::MAX_LINE_BYTES
                    );
                    return Ok(());
                }
            }
        }
    }

    fn handle_line(&self, line: &[u8], outbound: &Outbound) {
        let Ok(text) = std::str::from_utf8(line) else {
            tracing::warn!("ignoring non-UTF-8 line from {}", self.peer);
            return;
        };
        match parse_command(text) {
            Ok(Command::Get) => self.reply_status(outbound),
            Ok(Command::Set(token)) => {
                tracing::info!("{} requested SET {token}", self.peer);
                self.controller.start(token);
                self.reply_status(outbound);
            }
            Err(ProtocolError::Unknown(command)) => {
                tracing::info!("ignoring unknown command {command:?} from {}", self.peer);
            }
            Err(err) => {
                tracing::warn!("ignoring line from {}: {err}", self.peer);
            }
        }
    }

    fn reply_status(&self, outbound: &Outbound) {
        match format_status(&self.controller.report()) {
            Ok(line) => {
                if !outbound.reply(line) {
                    tracing::debug!("writer for {} has gone away", self.peer);
                }
            }
            Err(err) => tracing::error!("failed to answer {}: {err:#}", self.peer),
        }
    }
}

fn spawn_writer(
    stream: TcpStream,
    rx: Receiver<String>,
    closing: Arc<AtomicBool>,
    peer: SocketAddr,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("session-writer-{peer}"))
        .spawn(move || {
            let mut writer = BufWriter::new(stream);
            if let Err(err) = write_lines(&mut writer, &rx, &closing) {
                tracing::debug!("writer for {peer} stopped: {err}");
            }
        })
        .context("failed to spawn session writer")
}

/// Drain queued lines onto the socket, flushing whenever the queue runs dry.
fn write_lines<W: Write>(
    writer: &mut W,
    rx: &Receiver<String>,
    closing: &AtomicBool,
) -> std::io::Result<()> {
    while !closing.load(Ordering::Acquire) {
        match rx.recv_timeout(WRITER_POLL) {
            Ok(line) => {
                writer.write_all(line.as_bytes())?;
                writer.write_all(LINE_TERMINATOR)?;
                if rx.is_empty() {
                    writer.flush()?;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    writer.flush()
}
