//! TCP transport and the host entry point.
//!
//! One client at a time on a line-oriented socket. In foreground mode the
//! accepted connection is driven by the VM thread's interact loop; in
//! background mode a dedicated server thread owns the listener and the client
//! socket, tokenizes lines, and forwards anything that needs VM access to the
//! suspended VM thread.

use std::io::{BufRead, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::buf::Sink;
use crate::engine::{update_citop, update_file_pos, Config, Mode, Shared, PAUSED};
use crate::exec;
use crate::lang::Command;
use crate::vm::Vm;
use crate::Result;

/// Input lines longer than this are rejected as a whole.
const MAX_LINE: usize = 64 * 1024 - 1;

/// Client reads poll at this interval.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// One read from the operator.
#[derive(Debug)]
pub(crate) enum Input {
    Line(String),
    /// A line overflowed the input buffer and was dropped.
    TooLong,
}

/// Line-assembling reader over the debugger's input endpoint.
#[derive(Debug)]
pub(crate) enum ClientInput {
    Stdin,
    Socket { stream: TcpStream, buf: Vec<u8> },
}

impl ClientInput {
    pub(crate) fn socket(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_read_timeout(Some(POLL_TIMEOUT))?;
        Ok(Self::Socket {
            stream,
            buf: Vec::new(),
        })
    }

    /// Blocks until a full line, EOF (`Ok(None)`), or a transport error.
    pub(crate) fn read_line(&mut self) -> std::io::Result<Option<Input>> {
        match self {
            Self::Stdin => {
                let mut line = String::new();
                let n = std::io::stdin().lock().read_line(&mut line)?;
                if n == 0 {
                    return Ok(None);
                }
                if line.ends_with('\n') {
                    line.pop();
                }
                Ok(Some(Input::Line(line)))
            }
            Self::Socket { stream, buf } => {
                let mut chunk = [0u8; 1024];
                loop {
                    if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let rest = buf.split_off(pos + 1);
                        let mut line = std::mem::replace(buf, rest);
                        line.pop();
                        let line = String::from_utf8_lossy(&line).into_owned();
                        return Ok(Some(Input::Line(line)));
                    }
                    if buf.len() > MAX_LINE {
                        buf.clear();
                        return Ok(Some(Input::TooLong));
                    }
                    match stream.read(&mut chunk) {
                        Ok(0) => return Ok(None),
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        Err(err)
                            if matches!(
                                err.kind(),
                                std::io::ErrorKind::WouldBlock
                                    | std::io::ErrorKind::TimedOut
                                    | std::io::ErrorKind::Interrupted
                            ) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }
}

/// Binds the listener and wires the chosen mode up.
///
/// Inline and foreground modes trigger the initial pause before returning;
/// background mode spawns the server thread and lets the VM run.
pub(crate) fn start(mode: Mode, conf: Config, addr: &str, vm: &mut Vm) -> Result<Arc<Shared>> {
    match mode {
        Mode::Inline => {
            let shared = Arc::new(Shared::new(Mode::Inline, conf, None));
            shared.state.lock().sink = Sink::Stdout;
            *shared.io.lock() = Some(ClientInput::Stdin);
            shared.interrupt(vm, 0);
            Ok(shared)
        }
        Mode::Foreground => {
            let listener = TcpListener::bind((addr, conf.port))?;
            let local = listener.local_addr()?;
            let shared = Arc::new(Shared::new(Mode::Foreground, conf, Some(local)));
            println!("debug server started, waiting for client ...");
            let (stream, peer) = accept_client(&listener)?;
            drop(listener);
            info!("debugger client connected from {peer}");
            shared.state.lock().sink = Sink::Client(stream.try_clone()?);
            *shared.io.lock() = Some(ClientInput::socket(stream)?);
            println!("client connected");
            shared.interrupt(vm, 0);
            Ok(shared)
        }
        Mode::Background => {
            let listener = TcpListener::bind((addr, conf.port))?;
            let local = listener.local_addr()?;
            let shared = Arc::new(Shared::new(Mode::Background, conf, Some(local)));
            let server = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("ldbg-server".into())
                .spawn(move || serve(&server, &listener))?;
            Ok(shared)
        }
    }
}

fn accept_client(listener: &TcpListener) -> std::io::Result<(TcpStream, SocketAddr)> {
    loop {
        match listener.accept() {
            Ok(accepted) => return Ok(accepted),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

/// Background server thread: accept one client at a time and serve it.
fn serve(shared: &Shared, listener: &TcpListener) {
    loop {
        let (stream, peer) = match accept_client(listener) {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        info!("debugger client connected from {peer}");

        let writer = stream.try_clone().and_then(|w| {
            ClientInput::socket(stream).map(|input| (w, input))
        });
        let (writer, mut input) = match writer {
            Ok(pair) => pair,
            Err(err) => {
                warn!("client setup failed: {err}");
                continue;
            }
        };
        {
            let ds = &mut *shared.state.lock();
            ds.sink = Sink::Client(writer);
            ds.out
                .push_str("Lua VM is running, use command 'pause' to pause it.\n");
            ds.flush();
        }

        loop {
            match input.read_line() {
                Ok(Some(Input::Line(line))) => serve_line(shared, &line),
                Ok(Some(Input::TooLong)) => {
                    let ds = &mut *shared.state.lock();
                    ds.out.push_str("invalid command line");
                    ds.flush();
                }
                Ok(None) => {
                    debug!("client disconnected");
                    break;
                }
                Err(err) => {
                    debug!("client read failed: {err}");
                    break;
                }
            }
        }

        detach(shared);
    }
}

/// Handles one command line on the server thread.
///
/// Only `pause`, `quit`, and the error replies are served here; while the VM
/// is paused every other command is queued for the suspended VM thread, which
/// executes it with full VM access and writes the reply itself.
fn serve_line(shared: &Shared, line: &str) {
    match line.parse::<Command>() {
        Err(_) => {
            let ds = &mut *shared.state.lock();
            ds.out.push_str("invalid command line");
            ds.flush();
        }
        Ok(Command::Empty) => {
            let ds = &mut *shared.state.lock();
            ds.flush();
        }
        Ok(Command::Unknown(cmd)) => {
            let ds = &mut *shared.state.lock();
            ds.out
                .push_fmt(format_args!("unknown command \"{cmd}\""));
            ds.flush();
        }
        Ok(Command::Pause) => {
            let ds = &mut *shared.state.lock();
            let _ = exec::pause(ds, shared);
            ds.flush();
        }
        Ok(Command::Quit) => {
            let ds = &mut *shared.state.lock();
            let _ = exec::quit(ds);
            ds.flush();
        }
        Ok(_) if shared.cont() != PAUSED => {
            let ds = &mut *shared.state.lock();
            ds.out
                .push_str("Lua VM is running, use command 'pause' to pause it.");
            ds.flush();
        }
        Ok(_) => {
            let mut ds = shared.state.lock();
            ds.pending.push_back(line.to_string());
            drop(ds);
            shared.cond.notify_one();
        }
    }
}

/// Client-gone cleanup: every breakpoint is unpatched and a paused VM is
/// set free.
fn detach(shared: &Shared) {
    let mut ds = shared.state.lock();
    ds.sink = Sink::Discard;
    if shared.cont() == PAUSED {
        // The VM thread owns the unpatch-and-resume sequence; wake it.
        ds.detach = true;
        drop(ds);
        shared.cond.notify_one();
    } else {
        for id in ds.bps.ids() {
            ds.bps.remove(id);
        }
        ds.rtbp = None;
        ds.restorebp = None;
        debug!("detached while running; breakpoints unpatched");
    }
}

/// Panic hook: surface the panic to an attached client, or write a post-mortem
/// dump file when nobody is listening.
pub(crate) fn on_panic(shared: &Shared, vm: &mut Vm, msg: &str) {
    let attached = {
        let ds = shared.state.lock();
        !matches!(ds.sink, Sink::Discard)
    };
    if attached {
        {
            let ds = &mut *shared.state.lock();
            ds.out.push_str(msg);
            ds.why = None;
        }
        shared.interrupt(vm, 0);
        return;
    }

    let ds = &mut *shared.state.lock();
    if update_citop(ds, vm).is_none() {
        warn!("panic without a Lua frame: {msg}");
        return;
    }
    update_file_pos(ds, vm);

    let _ = ds.out.take();
    ds.out.push_str(msg);
    ds.out.push_str("\n");
    exec::list_at_current(ds, vm);
    ds.out.push_str("\n############# arguments ############\n");
    exec::info_args(ds, vm);
    ds.out.push_str("\n############ locals ############\n");
    exec::info_locals(ds, vm);
    ds.out.push_str("\n############ upvals ############\n");
    exec::info_upvals(ds, vm);

    let path = ds
        .conf
        .dump_dir
        .join(format!("ldb-{}.dump", std::process::id()));
    match std::fs::write(&path, ds.out.take()) {
        Ok(()) => info!("panic dump written to {}", path.display()),
        Err(err) => warn!("could not write panic dump: {err}"),
    }
}
