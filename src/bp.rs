//! Breakpoint table.
//!
//! Up to [`MAX_BREAKPOINTS`] user breakpoints plus one reserved pseudo slot
//! used by the stepping strategies. Each entry remembers the instruction word
//! it displaced so the slot can be restored. Ids are allocated monotonically
//! from 1; deleted entries park on a LIFO freelist and keep their id, so
//! operators can reference stable numbers across a session.

use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;
use thiserror::Error;

use crate::vm::{Instruction, Opcode, Proto, SrcId};

/// Capacity of the user id space.
pub const MAX_BREAKPOINTS: usize = 99;

/// Reserved id of the stepping strategies' one-shot breakpoint.
pub const PSEUDO_ID: u32 = MAX_BREAKPOINTS as u32 + 1;

/// A planted breakpoint.
#[derive(Clone, Debug)]
pub struct Breakpoint {
    pub id: u32,
    /// Delete on first hit.
    pub temp: bool,
    /// Armed but inert; the code slot holds the original word.
    pub disabled: bool,
    pub src: SrcId,
    pub line: u32,
    pub proto: Arc<Proto>,
    pub codepos: usize,
    /// The displaced instruction.
    pub saved: Instruction,
}

impl Breakpoint {
    /// Writes the interrupt word into the code slot.
    pub fn implant(&self) {
        self.proto
            .code
            .patch(self.codepos, Instruction::new_ax(Opcode::Interrupt, self.id));
    }

    /// Puts the displaced instruction back.
    pub fn restore(&self) {
        self.proto.code.patch(self.codepos, self.saved);
    }
}

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a breakpoint could not be set.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// too many breakpoints
    #[error("too many breakpoints")]
    TooMany,
    /// breakpoint #N already exists
    #[error("breakpoint #{0} already exists")]
    Exists(u32),
    /// invalid file line to set a breakpoint
    #[error("invalid file line to set a breakpoint")]
    NoCode,
}

/// Finds the deepest prototype whose line range covers `line`.
///
/// A main chunk (`linedefined == 0`) covers every line of its file.
#[must_use]
pub fn find_proto(p: &Arc<Proto>, line: u32) -> Option<Arc<Proto>> {
    if p.linedefined != 0 && !(p.linedefined..=p.lastlinedefined).contains(&line) {
        return None;
    }
    for child in &*p.protos {
        if let Some(found) = find_proto(child, line) {
            return Some(found);
        }
    }
    Some(Arc::clone(p))
}

/// The breakpoint arena.
#[derive(Debug, Default)]
pub struct Breakpoints {
    live: IndexMap<u32, Breakpoint>,
    /// Ids of deleted entries, reused LIFO.
    free: Vec<u32>,
    allocated: u32,
    pseudo: Option<Breakpoint>,
}

impl Breakpoints {
    /// Sets a breakpoint at the first instruction of `line`.
    pub fn set(&mut self, src: SrcId, line: u32, root: &Arc<Proto>) -> Result<u32> {
        if self.live.len() == MAX_BREAKPOINTS {
            return Err(Error::TooMany);
        }
        if let Some(bp) = self.live.values().find(|bp| bp.src == src && bp.line == line) {
            return Err(Error::Exists(bp.id));
        }

        let proto = find_proto(root, line).ok_or(Error::NoCode)?;
        let codepos = proto
            .lineinfo
            .iter()
            .position(|&l| l == line)
            .ok_or(Error::NoCode)?;

        let id = self.free.pop().unwrap_or_else(|| {
            self.allocated += 1;
            self.allocated
        });
        let bp = Breakpoint {
            id,
            temp: false,
            disabled: false,
            src,
            line,
            saved: proto.code.get(codepos),
            proto,
            codepos,
        };
        bp.implant();
        debug!("breakpoint #{id} implanted at pc {codepos}");
        self.live.insert(id, bp);
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        if id == PSEUDO_ID {
            self.pseudo.as_ref()
        } else {
            self.live.get(&id)
        }
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Breakpoint> {
        if id == PSEUDO_ID {
            self.pseudo.as_mut()
        } else {
            self.live.get_mut(&id)
        }
    }

    /// Restores the displaced instruction, unlinks the entry, and parks its
    /// id on the freelist. Returns whether the id was live.
    pub fn remove(&mut self, id: u32) -> bool {
        let Some(bp) = self.live.shift_remove(&id) else {
            return false;
        };
        bp.restore();
        self.free.push(id);
        debug!("breakpoint #{id} deleted");
        true
    }

    /// Live user breakpoints, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.live.values()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.live.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Total of live entries and parked ids; never exceeds the id space.
    #[must_use]
    pub fn accounted(&self) -> usize {
        self.live.len() + self.free.len()
    }

    /// Arms the one-shot pseudo breakpoint at (`proto`, `codepos`).
    pub fn arm_pseudo(&mut self, proto: Arc<Proto>, codepos: usize) {
        let bp = Breakpoint {
            id: PSEUDO_ID,
            temp: true,
            disabled: false,
            src: proto.source,
            line: proto.lineinfo.get(codepos).copied().unwrap_or(0),
            saved: proto.code.get(codepos),
            proto,
            codepos,
        };
        bp.implant();
        debug!("pseudo breakpoint armed at pc {codepos}");
        self.pseudo = Some(bp);
    }

    /// Drops the pseudo entry (its slot must already be restored).
    pub fn clear_pseudo(&mut self) {
        self.pseudo = None;
    }
}
