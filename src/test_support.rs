//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use uuid::Uuid;

use crate::api::{
    ApiFuture, Credentials, ImageId, LifecycleApi, RunState, VmId, VmSpec, VmState, VmSummary,
};
use crate::transport::{
    CommandInvocation, CommandOutput, CommandRunner, ProcessCommandRunner, RunnerFuture,
    TransportConfig, TransportError, TunnelTransport,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of calls made across several doubles.
///
/// Sharing one journal between a runner and an API double lets tests assert
/// cross-component ordering, such as a flush preceding a commit.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    /// Returns a snapshot of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Returns the index of the first entry starting with `prefix`.
    #[must_use]
    pub fn position(&self, prefix: &str) -> Option<usize> {
        lock(&self.entries)
            .iter()
            .position(|entry| entry.starts_with(prefix))
    }
}

#[derive(Clone, Debug)]
enum ScriptedResponse {
    Output(CommandOutput),
    Timeout,
    SpawnFailure,
}

impl ScriptedResponse {
    fn resolve(self, invocation: &CommandInvocation) -> Result<CommandOutput, TransportError> {
        match self {
            Self::Output(output) => Ok(output),
            Self::Timeout => Err(TransportError::Timeout {
                after: invocation.timeout,
                stdout: String::new(),
                stderr: String::new(),
            }),
            Self::SpawnFailure => Err(TransportError::Spawn {
                program: invocation.program.clone(),
                message: String::from("simulated spawn failure"),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    by_command: BTreeMap<String, ScriptedResponse>,
    responses: VecDeque<ScriptedResponse>,
    fallback: Option<ScriptedResponse>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// When the queue is empty the fallback response is used, if one is set.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
    journal: Option<Journal>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records every remote command into `journal` as `ssh:<command>`.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.state).invocations.clone()
    }

    /// Returns the remote command (final argument) of each invocation.
    #[must_use]
    pub fn remote_commands(&self) -> Vec<String> {
        lock(&self.state)
            .invocations
            .iter()
            .filter_map(CommandInvocation::last_arg)
            .collect()
    }

    fn push(&self, response: ScriptedResponse) {
        lock(&self.state).responses.push_back(response);
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push(ScriptedResponse::Output(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes a successful reachability round-trip.
    pub fn push_ready(&self) {
        self.push_output(Some(0), "ready\n", "");
    }

    /// Pushes a timeout.
    pub fn push_timeout(&self) {
        self.push(ScriptedResponse::Timeout);
    }

    /// Pushes a failure to start the helper process.
    pub fn push_spawn_failure(&self) {
        self.push(ScriptedResponse::SpawnFailure);
    }

    /// Answers every invocation of the remote `command` with this output,
    /// ahead of the queue.
    pub fn respond_to(
        &self,
        command: impl Into<String>,
        code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.state).by_command.insert(
            command.into(),
            ScriptedResponse::Output(CommandOutput {
                code: Some(code),
                stdout: stdout.into(),
                stderr: stderr.into(),
            }),
        );
    }

    /// Answers every unscripted invocation with exit code `code`.
    pub fn fail_unscripted_with(&self, code: i32) {
        lock(&self.state).fallback = Some(ScriptedResponse::Output(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: String::from("connection refused"),
        }));
    }

    /// Answers every unscripted invocation with success.
    pub fn succeed_unscripted(&self) {
        lock(&self.state).fallback = Some(ScriptedResponse::Output(CommandOutput {
            code: Some(0),
            stdout: String::from("ready\n"),
            stderr: String::new(),
        }));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, invocation: &'a CommandInvocation) -> RunnerFuture<'a> {
        let response = {
            let mut state = lock(&self.state);
            state.invocations.push(invocation.clone());
            let keyed = invocation
                .last_arg()
                .and_then(|command| state.by_command.get(&command).cloned());
            keyed
                .or_else(|| state.responses.pop_front())
                .or_else(|| state.fallback.clone())
        };
        if let (Some(journal), Some(command)) = (&self.journal, invocation.last_arg()) {
            journal.record(format!("ssh:{command}"));
        }
        let result = response.map_or_else(
            || {
                Err(TransportError::Spawn {
                    program: invocation.program.clone(),
                    message: String::from("no scripted response available"),
                })
            },
            |scripted| scripted.resolve(invocation),
        );
        Box::pin(async move { result })
    }
}

/// Runner that executes the remote command on the local host with `sh -c`.
///
/// The SSH arguments are discarded and only the final remote command is run,
/// with the original stdin payload and timeout. This exercises the real
/// encoding and escaping paths without a network.
#[derive(Clone, Debug, Default)]
pub struct LoopbackRunner {
    commands: Arc<Mutex<Vec<String>>>,
}

impl LoopbackRunner {
    /// Creates a loopback runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the remote commands executed so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

impl CommandRunner for LoopbackRunner {
    fn run<'a>(&'a self, invocation: &'a CommandInvocation) -> RunnerFuture<'a> {
        Box::pin(async move {
            let command = invocation.last_arg().ok_or_else(|| TransportError::Spawn {
                program: invocation.program.clone(),
                message: String::from("missing remote command"),
            })?;
            lock(&self.commands).push(command.clone());
            let local = CommandInvocation {
                program: String::from("sh"),
                args: vec![OsString::from("-c"), OsString::from(command)],
                stdin: invocation.stdin.clone(),
                timeout: invocation.timeout,
            };
            ProcessCommandRunner.run(&local).await
        })
    }
}

/// Lifecycle operations that [`MemoryLifecycleApi`] can be told to fail.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ApiOp {
    /// `create_vm`.
    Create,
    /// `list_vms`.
    List,
    /// `get_vm`.
    Get,
    /// `delete_vm`.
    Delete,
    /// `branch_vm`.
    Branch,
    /// `commit_vm`.
    Commit,
    /// `restore_vm`.
    Restore,
    /// `set_run_state`.
    SetRunState,
    /// `fetch_credentials`.
    FetchCredentials,
}

impl ApiOp {
    const fn label(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::List => "list",
            Self::Get => "get",
            Self::Delete => "delete",
            Self::Branch => "branch",
            Self::Commit => "commit",
            Self::Restore => "restore",
            Self::SetRunState => "state",
            Self::FetchCredentials => "credentials",
        }
    }
}

/// Error returned by [`MemoryLifecycleApi`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{op:?} failed: {message}")]
pub struct MemoryApiError {
    /// Operation that failed.
    pub op: ApiOp,
    /// Failure description.
    pub message: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    vms: BTreeMap<VmId, VmSummary>,
    images: BTreeMap<ImageId, VmId>,
    boot_countdown: BTreeMap<VmId, usize>,
    boot_polls: Option<usize>,
    failures: BTreeSet<ApiOp>,
    calls: Vec<String>,
}

impl MemoryState {
    fn check(&mut self, op: ApiOp, target: &str) -> Result<(), MemoryApiError> {
        self.calls.push(format!("{} {target}", op.label()));
        if self.failures.contains(&op) {
            return Err(MemoryApiError {
                op,
                message: String::from("simulated api failure"),
            });
        }
        Ok(())
    }

    fn spawn_vm(&mut self) -> VmId {
        let id = VmId::new(format!("vm-{}", Uuid::new_v4().simple()));
        let state = match self.boot_polls {
            Some(0) => VmState::Running,
            Some(polls) => {
                self.boot_countdown.insert(id.clone(), polls);
                VmState::Booting
            }
            None => VmState::Booting,
        };
        self.vms.insert(
            id.clone(),
            VmSummary {
                id: id.clone(),
                state,
                created_at: None,
                owner_id: None,
            },
        );
        id
    }

    fn require_vm(&self, op: ApiOp, vm_id: &VmId) -> Result<(), MemoryApiError> {
        if self.vms.contains_key(vm_id) {
            return Ok(());
        }
        Err(MemoryApiError {
            op,
            message: format!("vm {vm_id} not found"),
        })
    }
}

/// In-memory lifecycle API that records every call.
///
/// Fresh VMs report `running` immediately unless
/// [`MemoryLifecycleApi::boot_after_polls`] or
/// [`MemoryLifecycleApi::never_boot`] says otherwise.
#[derive(Clone, Debug)]
pub struct MemoryLifecycleApi {
    state: Arc<Mutex<MemoryState>>,
    journal: Option<Journal>,
}

impl Default for MemoryLifecycleApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLifecycleApi {
    /// Creates an API with no VMs where fresh VMs boot instantly.
    #[must_use]
    pub fn new() -> Self {
        let state = MemoryState {
            boot_polls: Some(0),
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            journal: None,
        }
    }

    /// Records every call into `journal` as `api:<op> <target>`.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Fresh VMs report `booting` for `polls` state queries, then `running`.
    pub fn boot_after_polls(&self, polls: usize) {
        lock(&self.state).boot_polls = Some(polls);
    }

    /// Fresh VMs never leave `booting`.
    pub fn never_boot(&self) {
        lock(&self.state).boot_polls = None;
    }

    /// Makes every future call of `op` fail.
    pub fn fail(&self, op: ApiOp) {
        lock(&self.state).failures.insert(op);
    }

    /// Seeds a VM in the given state.
    pub fn insert_vm(&self, vm_id: &VmId, state: VmState) {
        lock(&self.state).vms.insert(
            vm_id.clone(),
            VmSummary {
                id: vm_id.clone(),
                state,
                created_at: None,
                owner_id: None,
            },
        );
    }

    /// Removes a VM out of band, as if deleted by another operator.
    pub fn remove_vm(&self, vm_id: &VmId) {
        lock(&self.state).vms.remove(vm_id);
    }

    /// Current state of a VM, if it exists.
    #[must_use]
    pub fn vm_state(&self, vm_id: &VmId) -> Option<VmState> {
        lock(&self.state)
            .vms
            .get(vm_id)
            .map(|vm| vm.state.clone())
    }

    /// Source VM of every image captured so far.
    #[must_use]
    pub fn images(&self) -> BTreeMap<ImageId, VmId> {
        lock(&self.state).images.clone()
    }

    /// Every call made so far, as `<op> <target>`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        lock(&self.state).calls.len()
    }

    fn enter(
        &self,
        op: ApiOp,
        target: &str,
    ) -> Result<std::sync::MutexGuard<'_, MemoryState>, MemoryApiError> {
        if let Some(journal) = &self.journal {
            journal.record(format!("api:{} {target}", op.label()));
        }
        let mut state = lock(&self.state);
        state.check(op, target)?;
        Ok(state)
    }

    fn create(&self) -> Result<VmId, MemoryApiError> {
        let mut state = self.enter(ApiOp::Create, "root")?;
        Ok(state.spawn_vm())
    }

    fn list(&self) -> Result<Vec<VmSummary>, MemoryApiError> {
        let state = self.enter(ApiOp::List, "*")?;
        Ok(state.vms.values().cloned().collect())
    }

    fn get(&self, vm_id: &VmId) -> Result<Option<VmSummary>, MemoryApiError> {
        let mut state = self.enter(ApiOp::Get, vm_id)?;
        let booted = match state.boot_countdown.get_mut(vm_id) {
            Some(remaining) if *remaining == 0 => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        };
        if booted {
            state.boot_countdown.remove(vm_id);
            if let Some(vm) = state.vms.get_mut(vm_id) {
                vm.state = VmState::Running;
            }
        }
        Ok(state.vms.get(vm_id).cloned())
    }

    fn delete(&self, vm_id: &VmId) -> Result<(), MemoryApiError> {
        let mut state = self.enter(ApiOp::Delete, vm_id)?;
        state.require_vm(ApiOp::Delete, vm_id)?;
        state.vms.remove(vm_id);
        Ok(())
    }

    fn branch(&self, vm_id: &VmId) -> Result<VmId, MemoryApiError> {
        let mut state = self.enter(ApiOp::Branch, vm_id)?;
        state.require_vm(ApiOp::Branch, vm_id)?;
        Ok(state.spawn_vm())
    }

    fn commit(&self, vm_id: &VmId, keep_paused: bool) -> Result<ImageId, MemoryApiError> {
        let mut state = self.enter(ApiOp::Commit, vm_id)?;
        state.require_vm(ApiOp::Commit, vm_id)?;
        let image = ImageId::new(format!("img-{}", Uuid::new_v4().simple()));
        state.images.insert(image.clone(), vm_id.clone());
        if keep_paused && let Some(vm) = state.vms.get_mut(vm_id) {
            vm.state = VmState::Paused;
        }
        Ok(image)
    }

    fn restore(&self, image_id: &ImageId) -> Result<VmId, MemoryApiError> {
        let mut state = self.enter(ApiOp::Restore, image_id)?;
        if !state.images.contains_key(image_id) {
            return Err(MemoryApiError {
                op: ApiOp::Restore,
                message: format!("image {image_id} not found"),
            });
        }
        Ok(state.spawn_vm())
    }

    fn set_state(&self, vm_id: &VmId, run_state: RunState) -> Result<(), MemoryApiError> {
        let mut state = self.enter(ApiOp::SetRunState, vm_id)?;
        state.require_vm(ApiOp::SetRunState, vm_id)?;
        if let Some(vm) = state.vms.get_mut(vm_id) {
            vm.state = match run_state {
                RunState::Paused => VmState::Paused,
                RunState::Running => VmState::Running,
            };
        }
        Ok(())
    }

    fn credentials(&self, vm_id: &VmId) -> Result<Credentials, MemoryApiError> {
        let state = self.enter(ApiOp::FetchCredentials, vm_id)?;
        state.require_vm(ApiOp::FetchCredentials, vm_id)?;
        Ok(Credentials::new(
            "-----BEGIN TEST KEY-----\nnot-a-real-key\n-----END TEST KEY-----",
        ))
    }
}

impl LifecycleApi for MemoryLifecycleApi {
    type Error = MemoryApiError;

    fn create_vm<'a>(&'a self, _spec: &'a VmSpec) -> ApiFuture<'a, VmId, Self::Error> {
        let result = self.create();
        Box::pin(async move { result })
    }

    fn list_vms(&self) -> ApiFuture<'_, Vec<VmSummary>, Self::Error> {
        let result = self.list();
        Box::pin(async move { result })
    }

    fn get_vm<'a>(&'a self, vm_id: &'a VmId) -> ApiFuture<'a, Option<VmSummary>, Self::Error> {
        let result = self.get(vm_id);
        Box::pin(async move { result })
    }

    fn delete_vm<'a>(&'a self, vm_id: &'a VmId) -> ApiFuture<'a, (), Self::Error> {
        let result = self.delete(vm_id);
        Box::pin(async move { result })
    }

    fn branch_vm<'a>(&'a self, vm_id: &'a VmId) -> ApiFuture<'a, VmId, Self::Error> {
        let result = self.branch(vm_id);
        Box::pin(async move { result })
    }

    fn commit_vm<'a>(
        &'a self,
        vm_id: &'a VmId,
        keep_paused: bool,
    ) -> ApiFuture<'a, ImageId, Self::Error> {
        let result = self.commit(vm_id, keep_paused);
        Box::pin(async move { result })
    }

    fn restore_vm<'a>(&'a self, image_id: &'a ImageId) -> ApiFuture<'a, VmId, Self::Error> {
        let result = self.restore(image_id);
        Box::pin(async move { result })
    }

    fn set_run_state<'a>(
        &'a self,
        vm_id: &'a VmId,
        state: RunState,
    ) -> ApiFuture<'a, (), Self::Error> {
        let result = self.set_state(vm_id, state);
        Box::pin(async move { result })
    }

    fn fetch_credentials<'a>(
        &'a self,
        vm_id: &'a VmId,
    ) -> ApiFuture<'a, Credentials, Self::Error> {
        let result = self.credentials(vm_id);
        Box::pin(async move { result })
    }
}

/// Tunnel transport whose credential files live in a private scratch
/// directory, removed when the value is dropped.
pub struct ScratchTransport<R: CommandRunner> {
    /// Transport under test.
    pub transport: TunnelTransport<R>,
    keys: TempDir,
}

impl<R: CommandRunner> ScratchTransport<R> {
    /// Builds a transport over `runner` with one-second probe settings.
    ///
    /// # Panics
    ///
    /// Panics when the scratch directory cannot be created.
    #[must_use]
    pub fn new(runner: R) -> Self {
        let keys = TempDir::new().unwrap_or_else(|err| panic!("scratch key dir: {err}"));
        let key_dir = Utf8PathBuf::from_path_buf(keys.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non utf8 key dir {}", path.display()));
        let mut config = TransportConfig::with_defaults();
        config.key_dir = Some(key_dir.into_string());
        config.probe_timeout_secs = 5;
        config.reachable_interval_secs = 1;
        let transport = TunnelTransport::new(config, runner)
            .unwrap_or_else(|err| panic!("scratch transport: {err}"));
        Self { transport, keys }
    }

    /// Splits off the transport; the key directory lives as long as the
    /// returned guard.
    #[must_use]
    pub fn into_parts(self) -> (TunnelTransport<R>, TempDir) {
        (self.transport, self.keys)
    }

    /// Names of credential directories still present under the key root.
    #[must_use]
    pub fn lingering_keys(&self) -> Vec<String> {
        lingering_entries(&self.keys)
    }
}

/// Names of the entries left inside `dir`, sorted.
///
/// # Panics
///
/// Panics when the directory cannot be listed.
#[must_use]
pub fn lingering_entries(dir: &TempDir) -> Vec<String> {
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non utf8 dir {}", path.display()));
    let handle = Dir::open_ambient_dir(&root, ambient_authority())
        .unwrap_or_else(|err| panic!("open {root}: {err}"));
    let mut names: Vec<String> = handle
        .entries()
        .unwrap_or_else(|err| panic!("list {root}: {err}"))
        .map(|entry| {
            entry
                .and_then(|found| found.file_name())
                .unwrap_or_else(|err| panic!("entry under {root}: {err}"))
        })
        .collect();
    names.sort();
    names
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Sets a single environment variable while holding the global mutex.
    pub async fn set_var(key: &str, value: &str) -> Self {
        Self::set_vars(&[(key, value)]).await
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
