//! Host port allocation for game server instances.
//!
//! A [`PortPool`] hands out unique ports from an inclusive `[min, max]` range.
//! Allocation walks a circular index array from a persistent cursor, so ports
//! are handed out in a fixed order:
//!
//! - ports already in use when the pool is built come first, in the order
//!   they were registered
//! - the rest of the range follows in a random permutation
//!
//! The pool is plain data with no locking. Callers that share it between tasks
//! must serialize access themselves.

use std::fmt::Debug;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

/// Lowest host port handed out by default.
pub const DEFAULT_MIN_PORT: u16 = 20000;

/// Highest host port handed out by default.
pub const DEFAULT_MAX_PORT: u16 = 30000;

/// Port allocation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Range bounds are inverted or include port 0.
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },

    /// Port lies outside the pool's range.
    #[error("port {port} outside range {min}-{max}")]
    PortOutOfRange { port: u16, min: u16, max: u16 },

    /// Port is already assigned.
    #[error("port {0} is already taken")]
    PortTaken(u16),

    /// Every port in the range is taken.
    #[error("port pool exhausted: no free port in {min}-{max}")]
    PoolExhausted { min: u16, max: u16 },
}

// ============================================================================
// Builder
// ============================================================================

/// Collects ports already in use before the pool's allocation order is fixed.
#[derive(Debug)]
pub struct PortPoolBuilder<O> {
    min: u16,
    max: u16,
    owners: Vec<Option<O>>,
    registered: Vec<u16>,
}

impl<O: Clone + PartialEq + Debug> PortPoolBuilder<O> {
    /// Mark `port` as held by `owner`.
    pub fn register(&mut self, owner: O, port: u16) -> Result<(), NetworkError> {
        let slot = slot_index(self.min, self.max, port)?;
        if self.owners[slot].is_some() {
            return Err(NetworkError::PortTaken(port));
        }
        self.owners[slot] = Some(owner);
        self.registered.push(port);
        Ok(())
    }

    /// Fix the allocation order and build the pool.
    pub fn build<R: Rng + ?Sized>(self, rng: &mut R) -> PortPool<O> {
        let mut free: Vec<u16> = (self.min..=self.max)
            .filter(|p| self.owners[(p - self.min) as usize].is_none())
            .collect();
        free.shuffle(rng);

        let mut indexes = self.registered;
        indexes.extend(free);

        PortPool {
            min: self.min,
            max: self.max,
            owners: self.owners,
            indexes,
            next_free_index: 0,
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Allocation table for one port range.
///
/// Each taken port records the owner it was handed to, so a release on
/// behalf of one owner never frees a port that has since moved to another.
#[derive(Debug)]
pub struct PortPool<O> {
    min: u16,
    max: u16,
    /// Owner per port, indexed by `port - min`.
    owners: Vec<Option<O>>,
    /// Circular allocation order over the whole range.
    indexes: Vec<u16>,
    /// Position in `indexes` where the next scan starts.
    next_free_index: usize,
}

impl<O: Clone + PartialEq + Debug> PortPool<O> {
    /// Start building a pool over the inclusive range `[min, max]`.
    pub fn builder(min: u16, max: u16) -> Result<PortPoolBuilder<O>, NetworkError> {
        if min == 0 || min > max {
            return Err(NetworkError::InvalidRange { min, max });
        }
        let size = (max - min) as usize + 1;
        Ok(PortPoolBuilder {
            min,
            max,
            owners: vec![None; size],
            registered: Vec::new(),
        })
    }

    /// Take the next free port for `owner`.
    ///
    /// Scans at most once around the index array starting at the cursor.
    pub fn allocate(&mut self, owner: O) -> Result<u16, NetworkError> {
        let len = self.indexes.len();
        for step in 0..len {
            let i = (self.next_free_index + step) % len;
            let port = self.indexes[i];
            let slot = &mut self.owners[(port - self.min) as usize];
            if slot.is_none() {
                *slot = Some(owner);
                self.next_free_index = (i + 1) % len;
                return Ok(port);
            }
        }

        Err(NetworkError::PoolExhausted {
            min: self.min,
            max: self.max,
        })
    }

    /// Free every port in `ports` currently held by `owner`.
    ///
    /// Ports held by someone else, already free, or out of range are left
    /// alone. Returns the number of ports freed.
    pub fn release(&mut self, owner: &O, ports: &[u16]) -> usize {
        let mut freed = 0;
        for &port in ports {
            let Ok(slot) = slot_index(self.min, self.max, port) else {
                continue;
            };
            if self.owners[slot].as_ref() == Some(owner) {
                self.owners[slot] = None;
                freed += 1;
            }
        }
        freed
    }

    /// Current holder of `port`.
    pub fn owner_of(&self, port: u16) -> Option<&O> {
        slot_index(self.min, self.max, port)
            .ok()
            .and_then(|slot| self.owners[slot].as_ref())
    }

    /// Number of ports in the range.
    pub fn capacity(&self) -> usize {
        self.owners.len()
    }

    /// Number of free ports.
    pub fn available(&self) -> usize {
        self.owners.iter().filter(|o| o.is_none()).count()
    }
}

fn slot_index(min: u16, max: u16, port: u16) -> Result<usize, NetworkError> {
    if port < min || port > max {
        return Err(NetworkError::PortOutOfRange { port, min, max });
    }
    Ok((port - min) as usize)
}
