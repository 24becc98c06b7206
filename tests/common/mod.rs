#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use shell_fs::command::{Binding, CommandError, CommandOutput, CommandRunner};
use shell_fs::fs::shell_fs::{ShellFs, ShellFsConfig};
use tokio::sync::Semaphore;

pub const LIST: &str = "list-files";
pub const TRANSFORM: &str = "render-file";

/// A scripted result: stdout on success, exit code on failure.
type Script = Result<Vec<u8>, i32>;

#[derive(Default)]
struct State {
    listing: Option<Script>,
    contents: HashMap<OsString, Script>,
    panics: Vec<OsString>,
    transform_calls: HashMap<OsString, usize>,
    bindings_seen: Vec<Vec<Binding>>,
}

/// Command runner returning scripted outputs and counting invocations.
///
/// The list command answers with whatever [`FakeRunner::set_listing`] scripted (empty by
/// default). The transform command answers with the scripted content of the file named by the
/// `INPUT` binding, or `content of <name>` if nothing was scripted.
#[derive(Clone, Default)]
pub struct FakeRunner {
    state: Arc<Mutex<State>>,
    list_calls: Arc<AtomicUsize>,
    delay: Arc<Mutex<Duration>>,
    /// Transforms of these files wait for a permit before answering.
    gates: Arc<Mutex<HashMap<OsString, Arc<Semaphore>>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listing(self, stdout: &str) -> Self {
        self.set_listing(stdout);
        self
    }

    pub fn set_listing(&self, stdout: &str) {
        self.state.lock().unwrap().listing = Some(Ok(stdout.as_bytes().to_vec()));
    }

    pub fn fail_listing(&self, code: i32) {
        self.state.lock().unwrap().listing = Some(Err(code));
    }

    pub fn set_content(&self, name: &str, stdout: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .contents
            .insert(name.into(), Ok(stdout.to_vec()));
    }

    pub fn fail_content(&self, name: &str, code: i32) {
        self.state
            .lock()
            .unwrap()
            .contents
            .insert(name.into(), Err(code));
    }

    pub fn panic_on(&self, name: &str) {
        self.state.lock().unwrap().panics.push(name.into());
    }

    /// Delay every command by `delay` before it answers.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Hold transforms of `name` until [`release`](Self::release) is called.
    pub fn hold(&self, name: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(name.into(), Arc::new(Semaphore::new(0)));
    }

    /// Let every held and future transform of `name` through.
    pub fn release(&self, name: &str) {
        if let Some(gate) = self.gates.lock().unwrap().remove(OsStr::new(name)) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn transform_calls(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .transform_calls
            .get(OsStr::new(name))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_transform_calls(&self) -> usize {
        self.state.lock().unwrap().transform_calls.values().sum()
    }

    pub fn bindings_seen(&self) -> Vec<Vec<Binding>> {
        self.state.lock().unwrap().bindings_seen.clone()
    }

    fn answer(script: Option<Script>) -> Result<CommandOutput, CommandError> {
        match script {
            Some(Ok(stdout)) => Ok(CommandOutput {
                stdout: Bytes::from(stdout),
            }),
            Some(Err(code)) => Err(CommandError::Exit {
                code: Some(code),
                stderr: format!("scripted failure {code}"),
            }),
            None => Ok(CommandOutput {
                stdout: Bytes::new(),
            }),
        }
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, command: &str, bindings: &[Binding]) -> Result<CommandOutput, CommandError> {
        let delay = *self.delay.lock().unwrap();
        match command {
            LIST => {
                self.list_calls.fetch_add(1, Ordering::SeqCst);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let script = self.state.lock().unwrap().listing.clone();
                Self::answer(script)
            }
            TRANSFORM => {
                let name = bindings
                    .iter()
                    .find(|(k, _)| k == "INPUT")
                    .map(|(_, v)| v.clone())
                    .unwrap();
                let (script, panics) = {
                    let mut state = self.state.lock().unwrap();
                    *state.transform_calls.entry(name.clone()).or_default() += 1;
                    state.bindings_seen.push(bindings.to_vec());
                    (
                        state.contents.get(&name).cloned(),
                        state.panics.contains(&name),
                    )
                };

                let gate = self.gates.lock().unwrap().get(&name).cloned();
                if let Some(gate) = gate {
                    drop(gate.acquire().await.unwrap());
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                assert!(!panics, "scripted panic for {name:?}");

                let mut default = b"content of ".to_vec();
                default.extend_from_slice(name.as_encoded_bytes());
                Self::answer(Some(script.unwrap_or(Ok(default))))
            }
            other => Err(CommandError::Exit {
                code: Some(127),
                stderr: format!("unknown command {other}"),
            }),
        }
    }
}

/// Windows long enough that nothing expires during a test unless time is advanced.
pub fn config() -> ShellFsConfig {
    ShellFsConfig {
        listing_freshness: Duration::from_secs(10),
        content_freshness: Duration::from_secs(60),
        failure_window: Duration::from_secs(5),
        ..ShellFsConfig::new(LIST, TRANSFORM)
    }
}

pub fn shell_fs(runner: &FakeRunner) -> Arc<ShellFs<FakeRunner>> {
    Arc::new(ShellFs::new(runner.clone(), config()))
}

pub fn shell_fs_with(runner: &FakeRunner, config: ShellFsConfig) -> Arc<ShellFs<FakeRunner>> {
    Arc::new(ShellFs::new(runner.clone(), config))
}
