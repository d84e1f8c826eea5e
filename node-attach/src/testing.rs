//! Test doubles shared by the unit tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::exec::{CommandRunner, ExecError, Invocation};

/// Canned result for a scripted command.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok(Vec<u8>),
    Exit(i32, Vec<u8>),
    Timeout,
}

impl Reply {
    pub(crate) fn ok(output: &str) -> Self {
        Reply::Ok(output.as_bytes().to_vec())
    }

    pub(crate) fn ok_bytes(output: Vec<u8>) -> Self {
        Reply::Ok(output)
    }

    pub(crate) fn exit(code: i32, output: &str) -> Self {
        Reply::Exit(code, output.as_bytes().to_vec())
    }
}

type Effect = Arc<dyn Fn() + Send + Sync>;

struct Rule {
    program: String,
    args: Vec<String>,
    reply: Reply,
    remaining: Option<usize>,
    effect: Option<Effect>,
}

impl Rule {
    /// Rule args must appear in the invocation args, in order.
    fn matches(&self, invocation: &Invocation) -> bool {
        if self.program != invocation.program {
            return false;
        }
        let mut actual = invocation.args.iter();
        self.args
            .iter()
            .all(|wanted| actual.by_ref().any(|arg| arg == wanted))
    }
}

/// Replays canned outputs and records every invocation.
///
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(self: Arc<Self>, rule: Rule) -> Arc<Self> {
        self.rules.lock().unwrap().push(rule);
        self
    }

    pub(crate) fn on(self: Arc<Self>, program: &str, args: &[&str], reply: Reply) -> Arc<Self> {
        self.push(Rule {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            reply,
            remaining: None,
            effect: None,
        })
    }

    /// Like [`on`](Self::on) but only answers the first matching call.
    pub(crate) fn once(self: Arc<Self>, program: &str, args: &[&str], reply: Reply) -> Arc<Self> {
        self.push(Rule {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            reply,
            remaining: Some(1),
            effect: None,
        })
    }

    /// Answer with `reply` after running `effect`, e.g. to create the
    /// sysfs entries the kernel would produce.
    pub(crate) fn on_effect(
        self: Arc<Self>,
        program: &str,
        args: &[&str],
        reply: Reply,
        effect: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        self.push(Rule {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            reply,
            remaining: None,
            effect: Some(Arc::new(effect)),
        })
    }

    pub(crate) fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls to `program` whose args contain `args` in order.
    pub(crate) fn count(&self, program: &str, args: &[&str]) -> usize {
        let probe = Rule {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            reply: Reply::Ok(Vec::new()),
            remaining: None,
            effect: None,
        };
        self.calls().iter().filter(|c| probe.matches(c)).count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<Vec<u8>, ExecError> {
        self.calls.lock().unwrap().push(invocation.clone());

        let (reply, effect) = {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter().position(|r| r.matches(invocation)) {
                Some(idx) => {
                    let rule = &mut rules[idx];
                    let found = (rule.reply.clone(), rule.effect.clone());
                    if let Some(remaining) = rule.remaining.as_mut() {
                        *remaining -= 1;
                        if *remaining == 0 {
                            rules.remove(idx);
                        }
                    }
                    found
                }
                None => (Reply::Ok(Vec::new()), None),
            }
        };

        if let Some(effect) = effect {
            effect();
        }

        match reply {
            Reply::Ok(out) => Ok(out),
            Reply::Exit(code, output) => Err(ExecError::Exit {
                command: invocation.command_line(),
                code: Some(code),
                output,
            }),
            Reply::Timeout => Err(ExecError::Timeout {
                program: invocation.program.clone(),
                timeout: invocation.timeout.unwrap_or(Duration::from_secs(1)),
            }),
        }
    }
}

/// Builder for a fake host tree (sysfs and /dev) under a temporary root.
///
/// Clones share the same directory, so a clone can be moved into a
/// [`ScriptedRunner::on_effect`] closure to play the kernel's part.
#[derive(Clone)]
pub(crate) struct HostTree {
    dir: Arc<tempfile::TempDir>,
}

impl HostTree {
    pub(crate) fn new() -> Self {
        Self {
            dir: Arc::new(tempfile::TempDir::new().unwrap()),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel.trim_start_matches('/'))
    }

    pub(crate) fn mkdir(&self, rel: &str) -> &Self {
        std::fs::create_dir_all(self.path(rel)).unwrap();
        self
    }

    pub(crate) fn write(&self, rel: &str, contents: &str) -> &Self {
        let path = self.path(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
        self
    }

    pub(crate) fn remove(&self, rel: &str) -> &Self {
        let path = self.path(rel);
        if path.is_dir() {
            std::fs::remove_dir_all(path).unwrap();
        } else {
            std::fs::remove_file(path).unwrap();
        }
        self
    }

    /// Register an iSCSI session for `iqn` on `host`/`session`.
    pub(crate) fn session(&self, host: u32, session: u32, iqn: &str) -> &Self {
        self.write(
            &format!(
                "sys/class/iscsi_host/host{host}/device/session{session}/iscsi_session/session{session}/targetname"
            ),
            &format!("{iqn}\n"),
        );
        self.write(
            &format!("sys/class/iscsi_session/session{session}/targetname"),
            &format!("{iqn}\n"),
        );
        self.write(&format!("sys/class/scsi_host/host{host}/scan"), "")
    }

    /// Expose `device` as LUN `lun` on `host`/`session`, with its /dev node.
    pub(crate) fn lun_device(&self, host: u32, session: u32, lun: u32, device: &str) -> &Self {
        self.mkdir(&format!(
            "sys/class/scsi_host/host{host}/device/session{session}/iscsi_session/session{session}/device/target{host}:0:0/{host}:0:0:{lun}/block/{device}"
        ));
        self.mkdir(&format!(
            "sys/class/iscsi_session/session{session}/device/target{host}:0:0/{host}:0:0:{lun}/block/{device}"
        ));
        self.mkdir(&format!("sys/block/{device}/holders"));
        self.write(&format!("sys/block/{device}/device/rescan"), "");
        self.write(&format!("sys/block/{device}/device/delete"), "");
        self.write(&format!("dev/{device}"), "")
    }

    /// Bind raw `devices` under the multipath device `dm`.
    pub(crate) fn multipath(&self, dm: &str, devices: &[&str]) -> &Self {
        for device in devices {
            self.mkdir(&format!("sys/block/{device}/holders/{dm}"));
            self.mkdir(&format!("sys/block/{dm}/slaves/{device}"));
        }
        self.write(&format!("dev/{dm}"), "")
    }
}
