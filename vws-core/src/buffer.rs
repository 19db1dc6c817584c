//! Growable byte accumulator used for staged socket reads and writes.

use std::fmt;

use crate::env;
use crate::error::{Error, Result};

/// Growable byte buffer. `len() <= capacity()` always holds; storage grows
/// geometrically through the environment's allocation hooks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Ok(Self {
            data: env::alloc(capacity)?,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Make room for `additional` more bytes without touching the contents,
    /// at least doubling capacity when growth is needed.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let needed = self.data.len().saturating_add(additional);
        if needed > self.data.capacity() {
            let target = needed.max(self.data.capacity().saturating_mul(2));
            let extra = target - self.data.len();
            env::grow(&mut self.data, extra)?;
        }
        Ok(())
    }

    /// Copy `bytes` to the end.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append formatted text.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<()> {
        match args.as_str() {
            Some(s) => self.append(s.as_bytes()),
            None => self.append(fmt::format(args).as_bytes()),
        }
    }

    /// Remove the first `n` bytes, shifting the rest to the front.
    pub fn drain(&mut self, n: usize) -> Result<()> {
        if n > self.data.len() {
            return Err(Error::InvalidArgument(format!(
                "drain of {} bytes from buffer holding {}",
                n,
                self.data.len()
            ))
            .report());
        }
        self.data.drain(..n);
        Ok(())
    }

    /// Drop contents but keep the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Move the contents out, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
