// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stream endpoints for running processes.
//!
//! - [`PipeStream`]: stdin/stdout pipes (stderr merged into stdout).
//! - [`PtyStream`]: the master side of a pseudo-terminal. Reads and writes are
//!   blocking system calls, so they run on tokio's blocking pool behind a
//!   small per-stream semaphore.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use super::traits::{Result, RunnerError, RunnerStream};

/// Default chunk size for reads.
pub const READ_CHUNK: usize = 1024;

/// Concurrent blocking calls allowed per terminal.
const PTY_WORKERS: usize = 4;

/// Lazily read chunks until EOF.
///
/// Errors end the sequence; the sequence cannot be restarted.
pub fn stream_read(stream: Arc<dyn RunnerStream>, chunk: usize) -> BoxStream<'static, Vec<u8>> {
    futures::stream::unfold(stream, move |stream| async move {
        match stream.read(chunk).await {
            Ok(data) if !data.is_empty() => Some((data, stream)),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Stream read ended with error");
                None
            }
        }
    })
    .boxed()
}

/// Lazily read newline-delimited lines until EOF.
pub fn stream_lines(stream: Arc<dyn RunnerStream>) -> BoxStream<'static, Vec<u8>> {
    futures::stream::unfold(stream, |stream| async move {
        match stream.readline().await {
            Ok(line) if !line.is_empty() => Some((line, stream)),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Stream readline ended with error");
                None
            }
        }
    })
    .boxed()
}

/// Stream over a child's stdin/stdout pipes.
pub struct PipeStream {
    stdout: Mutex<BufReader<ChildStdout>>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl PipeStream {
    /// Wrap the pipes of a spawned child.
    pub fn new(stdout: ChildStdout, stdin: ChildStdin) -> Self {
        Self {
            stdout: Mutex::new(BufReader::new(stdout)),
            stdin: Mutex::new(Some(stdin)),
        }
    }
}

#[async_trait]
impl RunnerStream for PipeStream {
    async fn read(&self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n.max(1)];
        let got = self.stdout.lock().await.read(&mut buf).await?;
        buf.truncate(got);
        Ok(buf)
    }

    async fn readline(&self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        self.stdout.lock().await.read_until(b'\n', &mut line).await?;
        Ok(line)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| RunnerError::InvalidState("stdin already closed".to_string()))?;
        pipe.write_all(data).await?;
        pipe.flush().await?;
        Ok(())
    }

    async fn writeline(&self, data: &[u8]) -> Result<()> {
        let mut line = Vec::with_capacity(data.len() + 1);
        line.extend_from_slice(data);
        line.push(b'\n');
        self.write(&line).await
    }

    async fn write_eof(&self) -> Result<()> {
        // Dropping the handle closes the pipe.
        self.stdin.lock().await.take();
        Ok(())
    }
}

/// Stream over the master side of a pseudo-terminal.
///
/// `read` and `readline` are cancel-safe: a blocking read still in flight
/// when the caller gives up is kept and awaited by the next reader, so no
/// output is lost.
pub struct PtyStream {
    master: Arc<File>,
    workers: Arc<Semaphore>,
    reader: Mutex<PtyReader>,
}

#[derive(Default)]
struct PtyReader {
    pending: Vec<u8>,
    inflight: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
}

impl PtyStream {
    /// Wrap a terminal master.
    pub fn new(master: File) -> Self {
        Self {
            master: Arc::new(master),
            workers: Arc::new(Semaphore::new(PTY_WORKERS)),
            reader: Mutex::new(PtyReader::default()),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> std::io::Result<T> + Send + 'static,
    {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| RunnerError::InvalidState("terminal stream closed".to_string()))?;
        let master = self.master.clone();
        let joined = tokio::task::spawn_blocking(move || op(&master))
            .await
            .map_err(|e| RunnerError::Io(std::io::Error::other(e)))?;
        Ok(joined?)
    }

    /// Append the next raw chunk to `reader.pending`.
    ///
    /// Returns false at EOF; I/O errors (EIO once the child is gone) count
    /// as EOF.
    async fn fill(&self, reader: &mut PtyReader, n: usize) -> bool {
        if reader.inflight.is_none() {
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                return false;
            };
            let master = self.master.clone();
            let size = n.max(1);
            reader.inflight = Some(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut file: &File = &master;
                let mut buf = vec![0u8; size];
                let got = file.read(&mut buf)?;
                buf.truncate(got);
                Ok(buf)
            }));
        }
        let Some(inflight) = reader.inflight.as_mut() else {
            return false;
        };
        let joined = inflight.await;
        reader.inflight = None;

        match joined {
            Ok(Ok(data)) if !data.is_empty() => {
                reader.pending.extend_from_slice(&data);
                true
            }
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                debug!(error = %e, "Terminal read returned error, treating as EOF");
                false
            }
            Err(e) => {
                debug!(error = %e, "Terminal read task failed, treating as EOF");
                false
            }
        }
    }
}

#[async_trait]
impl RunnerStream for PtyStream {
    async fn read(&self, n: usize) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        if reader.pending.is_empty() && !self.fill(&mut reader, n).await {
            return Ok(Vec::new());
        }
        let take = n.max(1).min(reader.pending.len());
        Ok(reader.pending.drain(..take).collect())
    }

    async fn readline(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        loop {
            if let Some(idx) = reader.pending.iter().position(|b| *b == b'\n') {
                return Ok(reader.pending.drain(..=idx).collect());
            }
            if !self.fill(&mut reader, READ_CHUNK).await {
                return Ok(std::mem::take(&mut reader.pending));
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.blocking(move |mut master| master.write_all(&data))
            .await
    }

    async fn writeline(&self, data: &[u8]) -> Result<()> {
        let mut line = Vec::with_capacity(data.len() + 1);
        line.extend_from_slice(data);
        line.push(b'\n');
        self.write(&line).await
    }

    async fn write_eof(&self) -> Result<()> {
        Ok(())
    }
}
