// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub use retrovfs_err::*;

use std::sync::{Arc, Mutex, PoisonError};

/// Byte-addressed storage a file system driver sits on top of. Offsets are
/// absolute within the backing volume.
pub trait DataStorage: Send {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;

    fn len(&self) -> Result<u64>;

    fn flush(&self) -> Result<()>;
}

impl<DS: DataStorage + Sync> DataStorage for Arc<DS> {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        (**self).read(offset, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        (**self).write(offset, buffer)
    }

    fn len(&self) -> Result<u64> {
        (**self).len()
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

/// Volume held entirely in memory. Writes past the end grow the buffer.
pub struct MemStorage {
    data: Mutex<Vec<u8>>,
}

impl MemStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn with_len(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DataStorage for MemStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let data = self.lock();
        let start = offset as usize;
        let end = start.checked_add(buffer.len()).ok_or(VfsError::IoError)?;
        if end > data.len() {
            return Err(VfsError::IoError.into());
        }

        buffer.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        let mut data = self.lock();
        let start = offset as usize;
        let end = start.checked_add(buffer.len()).ok_or(VfsError::IoError)?;
        if end > data.len() {
            data.resize(end, 0);
        }

        data[start..end].copy_from_slice(buffer);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.lock().len() as u64)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
