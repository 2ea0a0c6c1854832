//! Lifecycle of the worker-runtime child process: spawn, readiness, reclaim
//! of leftovers from a frozen sandbox, liveness, and shutdown.
//!
//! The supervisor is the sole owner of the socket file, the pid file, and the
//! child process. It is generic over [`SupervisorDeps`] so the state machine
//! can be driven against a recording fake in tests.

use crate::config::Config;
use crate::error::Error;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use slog::{debug, error, info, warn, Logger};
use std::io::{self, Read};
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{self, Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Cadence of every wait loop in this module.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long the worker gets to create its socket.
const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a leftover worker gets to die after SIGTERM.
const RECLAIM_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the worker gets to shut down in `stop`.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    Absent,
    Starting,
    Ready,
    Serving,
    Stopping,
    /// Terminal: the sandbox should exit so the platform replaces it.
    Crashed,
}

/// How the worker runtime is launched: never daemonize, log to stderr, use
/// the sandbox's config file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    fn new(config: &Config) -> Self {
        WorkerCommand {
            program: config.worker_binary.clone(),
            args: vec![
                "--nodaemonize".to_string(),
                "--force-stderr".to_string(),
                "--fpm-config".to_string(),
                config.config_file.display().to_string(),
            ],
        }
    }
}

/// A running worker-runtime process.
pub trait WorkerChild {
    fn pid(&self) -> i32;

    /// Whether the process is still running. Reaps it once it has exited.
    fn is_alive(&mut self) -> bool;

    /// Ask the process to shut down.
    fn terminate(&mut self);
}

/// The supervisor's view of the operating system. Production uses
/// [`StdDeps`]; tests substitute a recording fake.
pub trait SupervisorDeps {
    type Child: WorkerChild;

    /// Launch the worker runtime with its output forwarded to standard error.
    fn spawn_worker(&mut self, command: &WorkerCommand) -> io::Result<Self::Child>;

    fn create_dir_all(&mut self, path: &Path) -> io::Result<()>;
    fn path_exists(&mut self, path: &Path) -> bool;
    fn remove_file(&mut self, path: &Path) -> io::Result<()>;
    fn read_to_string(&mut self, path: &Path) -> io::Result<String>;

    /// Our own pid, for detecting pid-file reuse.
    fn own_pid(&mut self) -> i32;

    /// Whether `pid` names a live process group.
    fn process_group_exists(&mut self, pid: i32) -> bool;

    /// SIGTERM `pid`. `Ok(false)` means the process was already gone.
    fn terminate_process(&mut self, pid: i32) -> io::Result<bool>;

    fn sleep(&mut self, duration: Duration);
    fn now(&mut self) -> Instant;
}

pub struct Supervisor<DepsT: SupervisorDeps> {
    deps: DepsT,
    config: Config,
    state: WorkerState,
    child: Option<DepsT::Child>,
    log: Logger,
}

impl<DepsT: SupervisorDeps> Supervisor<DepsT> {
    pub fn new(deps: DepsT, config: Config, log: Logger) -> Self {
        Supervisor {
            deps,
            config,
            state: WorkerState::Absent,
            child: None,
            log,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Spawn the worker and wait for its socket, reclaiming any leftover
    /// worker from a previous sandbox first.
    pub fn start(&mut self) -> Result<(), Error> {
        assert_eq!(self.state, WorkerState::Absent, "worker already started");
        self.state = WorkerState::Starting;
        match self.start_inner() {
            Ok(child) => {
                self.child = Some(child);
                self.state = WorkerState::Ready;
                Ok(())
            }
            Err(err) => {
                self.state = WorkerState::Crashed;
                Err(err)
            }
        }
    }

    fn start_inner(&mut self) -> Result<DepsT::Child, Error> {
        let socket_path = self.config.socket_path.clone();
        if let Some(dir) = socket_path.parent() {
            self.deps.create_dir_all(dir).map_err(|err| {
                Error::WorkerFailedToStart(format!("creating {}: {err}", dir.display()))
            })?;
        }
        if self.deps.path_exists(&socket_path) {
            self.reclaim_stale_worker()?;
        }

        let command = WorkerCommand::new(&self.config);
        info!(self.log, "starting worker"; "program" => command.program.display().to_string());
        let mut child = self.deps.spawn_worker(&command).map_err(|err| {
            Error::WorkerFailedToStart(format!("spawning {}: {err}", command.program.display()))
        })?;

        let give_up = self.deps.now() + READINESS_TIMEOUT;
        loop {
            if self.deps.path_exists(&socket_path) && child.is_alive() {
                break;
            }
            if !child.is_alive() {
                return Err(Error::WorkerFailedToStart(
                    "worker exited before creating its socket".to_string(),
                ));
            }
            if self.deps.now() >= give_up {
                return Err(Error::WorkerStartTimeout);
            }
            self.deps.sleep(POLL_INTERVAL);
        }
        debug!(self.log, "worker ready"; "pid" => child.pid());
        Ok(child)
    }

    /// The socket file exists before spawn: a previous sandbox froze without
    /// shutting its worker down. Clean up whatever it left behind.
    fn reclaim_stale_worker(&mut self) -> Result<(), Error> {
        let socket_path = self.config.socket_path.clone();
        let pid_file = self.config.pid_file.clone();
        warn!(self.log, "worker socket already exists, cleaning up after a previous instance";
            "socket" => socket_path.display().to_string());

        if !self.deps.path_exists(&pid_file) {
            info!(self.log, "no pid file left behind, removing the stale socket");
            return self.remove_stale(&socket_path, None);
        }
        let pid = self
            .deps
            .read_to_string(&pid_file)
            .ok()
            .and_then(|contents| contents.trim().parse::<i32>().ok())
            .unwrap_or(0);
        if pid <= 0 {
            info!(self.log, "pid file is unreadable, removing leftover files");
            return self.remove_stale(&socket_path, Some(&pid_file));
        }
        if !self.deps.process_group_exists(pid) {
            info!(self.log, "leftover worker is gone, removing leftover files"; "pid" => pid);
            return self.remove_stale(&socket_path, Some(&pid_file));
        }
        if pid == self.deps.own_pid() {
            info!(self.log, "pid file names this very process, the pid was recycled"; "pid" => pid);
            return self.remove_stale(&socket_path, Some(&pid_file));
        }

        info!(self.log, "leftover worker is still running, terminating it"; "pid" => pid);
        match self.deps.terminate_process(pid) {
            Ok(false) => {
                info!(self.log, "leftover worker exited before the signal landed"; "pid" => pid);
            }
            Ok(true) => {
                let give_up = self.deps.now() + RECLAIM_TIMEOUT;
                while self.deps.process_group_exists(pid) {
                    if self.deps.now() >= give_up {
                        return Err(Error::WorkerReclaimTimeout);
                    }
                    self.deps.sleep(POLL_INTERVAL);
                }
            }
            Err(err) => {
                return Err(Error::WorkerFailedToStart(format!(
                    "signaling leftover worker {pid}: {err}"
                )));
            }
        }
        self.remove_stale(&socket_path, Some(&pid_file))
    }

    fn remove_stale(&mut self, socket_path: &Path, pid_file: Option<&Path>) -> Result<(), Error> {
        self.remove_file(socket_path)?;
        if let Some(pid_file) = pid_file {
            self.remove_file(pid_file)?;
        }
        Ok(())
    }

    fn remove_file(&mut self, path: &Path) -> Result<(), Error> {
        match self.deps.remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::WorkerFailedToStart(format!(
                "removing {}: {err}",
                path.display()
            ))),
        }
    }

    /// A request is about to go out to the worker.
    pub fn begin_request(&mut self) {
        assert_eq!(self.state, WorkerState::Ready, "no ready worker");
        self.state = WorkerState::Serving;
    }

    pub fn end_request(&mut self) {
        assert_eq!(self.state, WorkerState::Serving);
        self.state = WorkerState::Ready;
    }

    /// Verify the child survived the last request. A dead child is fatal.
    pub fn probe_liveness(&mut self) -> Result<(), Error> {
        assert!(matches!(self.state, WorkerState::Ready | WorkerState::Serving));
        let alive = match self.child.as_mut() {
            Some(child) => child.is_alive(),
            None => false,
        };
        if alive {
            Ok(())
        } else {
            error!(self.log, "worker died");
            self.child = None;
            self.state = WorkerState::Crashed;
            Err(Error::WorkerCrashed)
        }
    }

    /// Shut the worker down. Safe to call when nothing is running.
    pub fn stop(&mut self) -> Result<(), Error> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        self.state = WorkerState::Stopping;
        info!(self.log, "stopping worker"; "pid" => child.pid());
        child.terminate();
        let give_up = self.deps.now() + STOP_GRACE;
        while child.is_alive() && self.deps.now() < give_up {
            self.deps.sleep(POLL_INTERVAL);
        }

        let socket_path = self.config.socket_path.clone();
        if self.deps.path_exists(&socket_path) {
            // Dropping `child` force-kills whatever is left.
            self.state = WorkerState::Crashed;
            return Err(Error::WorkerStopFailed);
        }
        let pid_file = self.config.pid_file.clone();
        if self.deps.path_exists(&pid_file) {
            let _ = self.deps.remove_file(&pid_file);
        }
        self.state = WorkerState::Absent;
        Ok(())
    }
}

/// Production dependencies: real processes, real filesystem, real clock.
pub struct StdDeps;

impl StdDeps {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        StdDeps
    }
}

impl SupervisorDeps for StdDeps {
    type Child = StdChild;

    fn spawn_worker(&mut self, command: &WorkerCommand) -> io::Result<StdChild> {
        // Its own process group, so a recycled parent pid can never alias the
        // worker, and the platform's signals don't reach it directly.
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()?;
        // Forward both output streams to our stderr unchanged; they are the
        // application's platform logs.
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || forward_to_stderr(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || forward_to_stderr(stderr));
        }
        Ok(StdChild { inner: child })
    }

    fn create_dir_all(&mut self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn path_exists(&mut self, path: &Path) -> bool {
        path.exists()
    }

    fn remove_file(&mut self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn read_to_string(&mut self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn own_pid(&mut self) -> i32 {
        process::id() as i32
    }

    fn process_group_exists(&mut self, pid: i32) -> bool {
        unistd::getpgid(Some(Pid::from_raw(pid))).is_ok()
    }

    fn terminate_process(&mut self, pid: i32) -> io::Result<bool> {
        match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }

    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration)
    }

    fn now(&mut self) -> Instant {
        Instant::now()
    }
}

fn forward_to_stderr(mut source: impl Read) {
    let mut stderr = io::stderr();
    let _ = io::copy(&mut source, &mut stderr);
}

/// A worker child that is SIGKILLed if it is still running when dropped, so
/// no exit path leaks the process.
pub struct StdChild {
    inner: Child,
}

impl WorkerChild for StdChild {
    fn pid(&self) -> i32 {
        self.inner.id() as i32
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.inner.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        let _ = signal::kill(Pid::from_raw(self.pid()), Signal::SIGTERM);
    }
}

impl Drop for StdChild {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.inner.kill();
            let _ = self.inner.wait();
        }
    }
}
