//! Lua Debugger (ldbg).
//!
//! An interactive source-level debugger embedded in a Lua-style stack-based
//! bytecode VM. Breakpoints are implanted by rewriting a prototype's code
//! word into an interrupt instruction carrying the breakpoint id; the VM
//! dispatches that instruction (or notices the asynchronous pause mark) into
//! [`Debugger::interrupt`], which suspends the VM thread and serves a remote
//! operator over a line-oriented TCP protocol until execution is resumed.

#![warn(clippy::pedantic)]
// Allowed lints: clippy
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

pub mod bp;
pub mod buf;
mod engine;
mod exec;
pub mod lang;
pub mod name;
pub mod path;
mod server;
pub mod source;
pub mod vm;

pub use self::engine::{Config, Mode};

use self::engine::Shared;
use self::vm::Vm;

/// The default debug-server port (0x1db9 spells "ldbg").
pub const PORT: u16 = 7609;

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error caused by a debugger command or by the transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Breakpoint argument errors.
    #[error(transparent)]
    Breakpoint(#[from] bp::Error),
    /// Malformed `break`/`tb` arguments.
    #[error("usage: break <file> <line>")]
    BreakUsage,
    /// Malformed `info` arguments.
    #[error("usage: info breaks|args|locals|upvals")]
    InfoUsage,
    /// Malformed bulk breakpoint verb.
    #[error("usage: {0} breaks [id ...]")]
    BulkUsage(&'static str),
    /// `break` named an unregistered file.
    #[error("file \"{0}\" not found")]
    FileNotFound(String),
    /// `list` named an unregistered file.
    #[error("file not found")]
    ListFileNotFound,
    /// `frame` walked off the call stack.
    #[error("frame not found")]
    FrameNotFound,
    /// `frame` selected a native activation.
    #[error("unable to enter C-frame")]
    NativeFrame,
    /// Bare `list` without a previous window.
    #[error("no previous listing")]
    NoListing,
    /// `until` found no enclosing loop.
    #[error("`until` should be used in a loop")]
    UntilNoLoop,
    /// Command-language parse error.
    #[error(transparent)]
    Language(#[from] lang::Error),
    /// Transport or file I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Unrecoverable internal error; the interact loop reports and exits.
    #[error("{0}")]
    Fatal(String),
}

/// Handle to an embedded debugger.
///
/// The host VM keeps one per process and calls back into it from its
/// dispatch loop; the handle is cheap to clone and safe to share with the
/// background server thread.
#[derive(Clone)]
pub struct Debugger {
    shared: Arc<Shared>,
}

impl Debugger {
    /// Starts the debugger with default [`Config`].
    ///
    /// In inline and foreground modes this pauses the VM immediately (after
    /// the foreground listener has accepted its client); in background mode
    /// the server thread is spawned and the VM keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the listener cannot be bound or the client
    /// socket cannot be configured; partially created state is torn down.
    pub fn start(vm: &mut Vm, mode: Mode, addr: &str) -> Result<Self> {
        Self::start_with(vm, mode, addr, Config::default())
    }

    /// Starts the debugger with an explicit [`Config`].
    pub fn start_with(vm: &mut Vm, mode: Mode, addr: &str, conf: Config) -> Result<Self> {
        let shared = server::start(mode, conf, addr, vm)?;
        Ok(Self { shared })
    }

    /// Interrupt entry point, invoked by the VM.
    ///
    /// `id` is the 24-bit operand of the dispatched interrupt word: a
    /// breakpoint id, or 0 when the asynchronous pause mark fired. When the
    /// stop surfaces, the calling thread blocks here until the operator
    /// resumes execution.
    pub fn interrupt(&self, vm: &mut Vm, id: u32) {
        self.shared.interrupt(vm, id);
    }

    /// Whether the asynchronous pause mark is set.
    ///
    /// The VM's dispatch loop consults this after every instruction fetch;
    /// the load is a single lock-free word.
    #[must_use]
    pub fn pause_requested(&self) -> bool {
        self.shared.pause_requested()
    }

    /// Surfaces a host panic.
    ///
    /// With a client attached the panic becomes an interrupt so the operator
    /// can inspect the wreckage; otherwise a post-mortem `ldb-<pid>.dump`
    /// file is written next to the process.
    pub fn on_panic(&self, vm: &mut Vm, msg: &str) {
        server::on_panic(&self.shared, vm, msg);
    }

    /// Address the debug server is listening on, in the TCP modes.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.addr
    }
}
