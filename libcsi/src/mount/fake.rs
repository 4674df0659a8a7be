//! In-memory stand-in for the kernel mount table and the mount helpers.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::exec::{ExecOutput, Executor};
use crate::mount::state::{MountState, StateDetector};

/// Simulates `mount`, `umount` and the FUSE helper against a fake mount
/// table, recording every command line it is asked to run.
#[derive(Default)]
pub(crate) struct FakeSystem {
    states: Mutex<HashMap<PathBuf, MountState>>,
    calls: Mutex<Vec<String>>,
    scripted: Mutex<HashMap<String, VecDeque<ExecOutput>>>,
}

impl FakeSystem {
    pub(crate) fn set_state(&self, path: impl AsRef<Path>, state: MountState) {
        self.states
            .lock()
            .unwrap()
            .insert(path.as_ref().to_path_buf(), state);
    }

    pub(crate) fn state(&self, path: impl AsRef<Path>) -> MountState {
        self.states
            .lock()
            .unwrap()
            .get(path.as_ref())
            .cloned()
            .unwrap_or(MountState::NotMounted)
    }

    /// Make the next run of `program` return `output` without side effects.
    pub(crate) fn script(&self, program: &str, output: ExecOutput) {
        self.scripted
            .lock()
            .unwrap()
            .entry(program.to_owned())
            .or_default()
            .push_back(output);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, program: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(program))
            .count()
    }
}

#[async_trait]
impl StateDetector for FakeSystem {
    async fn detect(&self, path: &Path) -> MountState {
        self.state(path)
    }
}

#[async_trait]
impl Executor for FakeSystem {
    async fn output(&self, program: &str, args: &[String]) -> std::io::Result<ExecOutput> {
        let mut line = program.to_owned();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.calls.lock().unwrap().push(line);

        if let Some(out) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(program)
            .and_then(VecDeque::pop_front)
        {
            return Ok(out);
        }

        let Some(target) = args.last().map(PathBuf::from) else {
            return Ok(ExecOutput::failed(1, format!("{program}: missing operand")));
        };
        let mut states = self.states.lock().unwrap();
        if program == "umount" {
            match states.get(&target) {
                Some(MountState::Mounted | MountState::Corrupted) => {
                    states.insert(target, MountState::NotMounted);
                    Ok(ExecOutput::ok())
                }
                _ => Ok(ExecOutput::failed(
                    32,
                    format!("umount: {}: not mounted.", target.display()),
                )),
            }
        } else {
            states.insert(target, MountState::Mounted);
            Ok(ExecOutput::ok())
        }
    }
}
