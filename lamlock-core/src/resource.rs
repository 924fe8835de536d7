use tracing::debug;

use crate::error::ResourceError;
use crate::types::RequestStamp;

/// Default number of slots in the shared resource
pub const DEFAULT_CAPACITY: usize = 8;

/// One peer's copy of the protected resource.
///
/// Each slot remembers the request stamp of the write that produced it.
/// A write carrying an older stamp than the slot's is superseded, so
/// replicas converge even when UPDATEs from successive writers arrive
/// out of order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedResource {
    values: Vec<i64>,
    versions: Vec<Option<RequestStamp>>,
}

impl SharedResource {
    /// A replica holding `1..=capacity`
    pub fn new(capacity: usize) -> Self {
        Self::from_values((1..=capacity as i64).collect())
    }

    pub fn from_values(values: Vec<i64>) -> Self {
        let versions = vec![None; values.len()];
        Self { values, versions }
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    pub fn read(&self, position: usize) -> Result<i64, ResourceError> {
        self.check(position)?;
        Ok(self.values[position])
    }

    /// Store `value` at `position` as written under `stamp`.
    /// Returns `Ok(false)` when a newer write already owns the slot.
    pub fn write(
        &mut self,
        position: usize,
        value: i64,
        stamp: RequestStamp,
    ) -> Result<bool, ResourceError> {
        self.check(position)?;
        if let Some(current) = self.versions[position] {
            if stamp.precedes(&current) {
                return Ok(false);
            }
        }
        self.values[position] = value;
        self.versions[position] = Some(stamp);
        Ok(true)
    }

    /// Inbound UPDATE path. Same rules as [`write`](Self::write); never
    /// causes further broadcasts.
    pub fn apply_update(
        &mut self,
        position: usize,
        value: i64,
        stamp: RequestStamp,
    ) -> Result<bool, ResourceError> {
        let applied = self.write(position, value, stamp)?;
        if !applied {
            debug!(position, value, writer = %stamp.peer, "update superseded by newer write");
        }
        Ok(applied)
    }

    /// Replace the whole contents. Slot versions are reset.
    pub fn replace(&mut self, values: Vec<i64>) -> Result<(), ResourceError> {
        if values.len() != self.values.len() {
            return Err(ResourceError::CapacityMismatch {
                expected: self.values.len(),
                actual: values.len(),
            });
        }
        self.values = values;
        self.versions.iter_mut().for_each(|v| *v = None);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<i64> {
        self.values.clone()
    }

    fn check(&self, position: usize) -> Result<(), ResourceError> {
        if position >= self.values.len() {
            return Err(ResourceError::OutOfRange {
                position,
                capacity: self.values.len(),
            });
        }
        Ok(())
    }
}

impl Default for SharedResource {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
