//! Child-process driver: spawns a tracee under `ptrace`, disables ASLR, and
//! single-steps it one instruction at a time. Deliberately dumb — it reads
//! registers and raw memory and nothing else; decoding and classification
//! belong to other crates in this workspace.

use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use spawn_ptrace::CommandPtraceSpawn;
use thiserror::Error;

/// Maximum x86 instruction length; the driver always over-reads this many
/// bytes so the decoder never starves on a multi-byte instruction.
pub const MAX_INSTR_LEN: usize = 15;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("failed to spawn tracee: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ptrace operation failed: {0}")]
    Ptrace(#[source] nix::errno::Errno),

    #[error("tracee appears to have spawned a second thread; multi-threaded tracees are not supported")]
    MultiThreaded,

    #[error("failed to inspect /proc/{pid}/task: {source}")]
    ProcRead {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
}

impl From<nix::errno::Errno> for TraceError {
    fn from(e: nix::errno::Errno) -> Self {
        TraceError::Ptrace(e)
    }
}

/// One single-stepped instruction: the tracee's instruction pointer before
/// the step, and up to [`MAX_INSTR_LEN`] bytes of memory read from there.
#[derive(Debug, Clone)]
pub struct TracedStep {
    pub ip: u64,
    pub bytes: Vec<u8>,
}

/// An actively traced child process, in a stopped state between steps.
pub struct Tracer {
    pid: Pid,
    exited: bool,
}

impl Tracer {
    /// Spawn `path` with `args` under `ptrace`, with ASLR disabled so
    /// repeated runs produce identical addresses.
    pub fn launch(path: &str, args: &[String]) -> Result<Self, TraceError> {
        let mut command = Command::new(path);
        command.args(args);

        // SAFETY: `personality` only touches the child's own process state
        // after fork and before exec; it calls no non-async-signal-safe code.
        unsafe {
            command.pre_exec(|| {
                nix::sys::personality::set(nix::sys::personality::Persona::ADDR_NO_RANDOMIZE)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let child = command.spawn_ptrace().map_err(TraceError::Spawn)?;
        let pid = Pid::from_raw(child.id() as i32);
        log::debug!("spawned {path} for tracing as pid {pid}");

        // The child is stopped at its own exec via TRACEME; consume that
        // initial stop before the caller's first `step()`.
        waitpid(pid, None).map_err(TraceError::from)?;

        Ok(Self { pid, exited: false })
    }

    /// Single-step the tracee by exactly one instruction.
    ///
    /// Returns `Ok(None)` once the tracee has exited. Memory reads that
    /// straddle an unmapped page are truncated rather than treated as an
    /// error — the decoder only needs as many bytes as the instruction
    /// actually occupies.
    pub fn step(&mut self) -> Result<Option<TracedStep>, TraceError> {
        if self.exited {
            return Ok(None);
        }

        self.guard_single_threaded()?;

        let regs = ptrace::getregs(self.pid)?;
        let ip = regs.rip;
        let bytes = self.read_memory(ip, MAX_INSTR_LEN);

        ptrace::step(self.pid, None)?;

        match waitpid(self.pid, None).map_err(TraceError::from)? {
            WaitStatus::Exited(_, status) => {
                log::debug!("tracee {} exited with status {status}", self.pid);
                self.exited = true;
            }
            WaitStatus::Signaled(_, signal, _) => {
                log::debug!("tracee {} terminated by signal {signal:?}", self.pid);
                self.exited = true;
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            WaitStatus::Stopped(_, signal) => {
                log::warn!("tracee {} stopped on unexpected signal {signal:?}", self.pid);
            }
            other => log::debug!("tracee {} wait status: {other:?}", self.pid),
        }

        Ok(Some(TracedStep { ip, bytes }))
    }

    /// Read up to `len` bytes of tracee memory at `address`, truncating on
    /// a short read rather than failing.
    fn read_memory(&self, address: u64, len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(len);
        let word_size = std::mem::size_of::<libc::c_long>();
        let mut offset = 0usize;

        while offset < len {
            match ptrace::read(self.pid, (address as usize + offset) as *mut libc::c_void) {
                Ok(word) => {
                    let word_bytes = word.to_ne_bytes();
                    let take = word_size.min(len - offset);
                    bytes.extend_from_slice(&word_bytes[..take]);
                    offset += word_size;
                }
                Err(_) => break,
            }
        }

        bytes.truncate(len.min(bytes.len()));
        bytes
    }

    /// Reject tracees that have spawned a second thread; this driver only
    /// single-steps one thread group at a time.
    fn guard_single_threaded(&self) -> Result<(), TraceError> {
        let task_dir = format!("/proc/{}/task", self.pid);
        let count = std::fs::read_dir(&task_dir)
            .map_err(|source| TraceError::ProcRead {
                pid: self.pid.as_raw(),
                source,
            })?
            .count();

        if count > 1 {
            return Err(TraceError::MultiThreaded);
        }
        Ok(())
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traced_step_carries_ip_and_bytes() {
        let step = TracedStep {
            ip: 0x1000,
            bytes: vec![0x90, 0x90],
        };
        assert_eq!(step.ip, 0x1000);
        assert_eq!(step.bytes.len(), 2);
    }

    // Exercises the real ptrace path against a trivial static binary; gated
    // behind Linux and `--ignored` since it needs CAP_SYS_PTRACE and a
    // built fixture binary, neither of which are available in a plain
    // unit-test run.
    #[test]
    #[cfg(target_os = "linux")]
    #[ignore]
    fn single_steps_true_binary() {
        let mut tracer = Tracer::launch("/bin/true", &[]).unwrap();
        let mut steps = 0;
        while tracer.step().unwrap().is_some() {
            steps += 1;
            if steps > 10_000 {
                break;
            }
        }
        assert!(steps > 0);
    }
}
