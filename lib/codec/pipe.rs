//! A channel-backed pipe between an export producer and its consumer.
//!
//! Exporters assemble their archive on a background thread that writes into
//! the pipe; the consumer reads from the other end. When the producer fails,
//! the error is delivered to the consumer at its next read, mirroring how a
//! closed-with-error pipe behaves.

use std::{
    io::{self, Read, Write},
    sync::mpsc::{sync_channel, Receiver, SyncSender},
    thread,
};

use crate::{OvermountError, OvermountResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many chunks the producer may run ahead of the consumer.
const PIPE_DEPTH: usize = 16;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The read half of an export pipe.
#[derive(Debug)]
pub struct PipeReader {
    receiver: Receiver<io::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    offset: usize,
    failed: bool,
}

/// The write half of an export pipe, held by the producer thread.
#[derive(Debug)]
pub(crate) struct PipeWriter {
    sender: SyncSender<io::Result<Vec<u8>>>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Spawns `producer` on a background thread and returns the read half of the
/// pipe it writes into. A producer error closes the pipe with that error so
/// the consumer observes it.
pub(crate) fn spawn<F>(producer: F) -> PipeReader
where
    F: FnOnce(&mut PipeWriter) -> OvermountResult<()> + Send + 'static,
{
    let (sender, receiver) = sync_channel(PIPE_DEPTH);
    let mut writer = PipeWriter { sender };

    thread::spawn(move || {
        if let Err(error) = producer(&mut writer) {
            tracing::error!("export producer failed: {}", error);
            writer.fail(error);
        }
    });

    PipeReader {
        receiver,
        buffer: Vec::new(),
        offset: 0,
        failed: false,
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PipeWriter {
    fn fail(&self, error: OvermountError) {
        // the consumer may already be gone; nothing to do then
        let _ = self.sender.send(Err(io::Error::other(error)));
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return io::Result::Ok(0);
        }

        self.sender
            .send(io::Result::Ok(buf.to_vec()))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        io::Result::Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Result::Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.offset < self.buffer.len() {
                let available = &self.buffer[self.offset..];
                let count = available.len().min(buf.len());
                buf[..count].copy_from_slice(&available[..count]);
                self.offset += count;
                return io::Result::Ok(count);
            }

            if self.failed {
                return io::Result::Ok(0);
            }

            match self.receiver.recv() {
                Result::Ok(io::Result::Ok(chunk)) => {
                    self.buffer = chunk;
                    self.offset = 0;
                }
                Result::Ok(Err(error)) => {
                    self.failed = true;
                    return Err(error);
                }
                // the producer finished and dropped its sender
                Err(_) => return io::Result::Ok(0),
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_streams_producer_output() -> anyhow::Result<()> {
        let mut reader = spawn(|writer| {
            writer.write_all(b"first chunk, ")?;
            writer.write_all(b"second chunk")?;
            Ok(())
        });

        let mut output = String::new();
        reader.read_to_string(&mut output)?;
        assert_eq!(output, "first chunk, second chunk");

        Ok(())
    }

    #[test]
    fn test_pipe_surfaces_producer_error() {
        let mut reader = spawn(|writer| {
            writer.write_all(b"partial output")?;
            Err(OvermountError::ImageCannotBeComposed(
                "tar writer gave out".into(),
            ))
        });

        let mut output = Vec::new();
        let error = reader
            .read_to_end(&mut output)
            .expect_err("the producer error should surface");
        assert!(error.to_string().contains("tar writer gave out"));
    }
}
