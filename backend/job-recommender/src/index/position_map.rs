//! Ordered log of job ids by index position
//!
//! The log mirrors insertion order into [`FlatIpIndex`](super::FlatIpIndex):
//! entry `n` names the job whose vector sits at position `n`. A job that is
//! re-indexed appears more than once; lookups by job id resolve to the
//! latest position.

use crate::error::IndexError;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionMap {
    log: Vec<Uuid>,
    latest: HashMap<Uuid, usize>,
}

impl PositionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from `(position, job_id)` pairs sorted by position
    ///
    /// Positions must be exactly `0..n`.
    pub fn from_log<I>(entries: I) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = (usize, Uuid)>,
    {
        let mut map = Self::new();
        for (position, job_id) in entries {
            map.record(job_id, position)?;
        }
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Record the job stored at `position`; only the next position is accepted
    pub fn record(&mut self, job_id: Uuid, position: usize) -> Result<(), IndexError> {
        if position != self.log.len() {
            return Err(IndexError::PositionOutOfOrder {
                expected: self.log.len(),
                actual: position,
            });
        }
        self.log.push(job_id);
        self.latest.insert(job_id, position);
        Ok(())
    }

    /// Latest position recorded for `job_id`
    pub fn position_of(&self, job_id: &Uuid) -> Option<usize> {
        self.latest.get(job_id).copied()
    }

    pub fn job_id_of(&self, position: usize) -> Option<Uuid> {
        self.log.get(position).copied()
    }

    /// True when `position` is the newest entry for its job
    pub fn is_current(&self, position: usize) -> bool {
        self.log
            .get(position)
            .and_then(|job_id| self.latest.get(job_id))
            .map(|latest| *latest == position)
            .unwrap_or(false)
    }

    /// Entries at `start..`, used to persist only what is new
    pub fn entries_from(&self, start: usize) -> Vec<(usize, Uuid)> {
        self.log
            .iter()
            .enumerate()
            .skip(start)
            .map(|(position, job_id)| (position, *job_id))
            .collect()
    }

    /// Distinct job ids currently indexed
    pub fn job_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.latest.keys()
    }

    pub fn distinct_jobs(&self) -> usize {
        self.latest.len()
    }
}
