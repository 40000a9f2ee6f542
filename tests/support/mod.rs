// Test support: a scripted Host standing in for the real tools.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use jackplug::{
    config::Settings,
    invoke::{CommandOutput, Host, RetryPolicy},
    trigger::FileFlag,
};
use tempfile::TempDir;

pub const FOCUSRITE_ONLY: &str = "\
**** List of PLAYBACK Hardware Devices ****
card 0: PCH [HDA Intel PCH], device 0: ALC3246 Analog [ALC3246 Analog]
  Subdevices: 1/1
card 1: Focusrite [Scarlett 2i2 USB], device 0: USB Audio [USB Audio]
  Subdevices: 1/1
";

pub const INTERNAL_ONLY: &str = "\
**** List of PLAYBACK Hardware Devices ****
card 0: PCH [HDA Intel PCH], device 0: ALC3246 Analog [ALC3246 Analog]
  Subdevices: 1/1
card 0: PCH [HDA Intel PCH], device 3: HDMI 0 [HDMI 0]
  Subdevices: 1/1
";

pub const BUS_DOWN: &str =
    "DBus exception: org.freedesktop.DBus.Error.Spawn.ChildExited: Process org.jackaudio.service exited";

/// Answers commands by the tail of their command line (so `runuser ... env
/// ... jack_control status` matches `jack_control status`). Queued answers
/// are consumed in order and the last one repeats. Unscripted commands fail
/// with exit 1 and no output, which is what `pgrep`/`pkill` do when nothing
/// matches.
#[derive(Default)]
pub struct ScriptedHost {
    answers: RefCell<HashMap<String, VecDeque<CommandOutput>>>,
    pub calls: RefCell<Vec<String>>,
    pub sleeps: RefCell<Vec<Duration>>,
    pub present: RefCell<HashSet<PathBuf>>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, tail: &str, outputs: Vec<CommandOutput>) -> &Self {
        self.answers
            .borrow_mut()
            .insert(tail.to_string(), outputs.into());
        self
    }

    pub fn ok(&self, tail: &str, text: &str) -> &Self {
        self.answer(tail, vec![CommandOutput::ok(text)])
    }

    /// A desktop user running the tool directly.
    pub fn as_user(&self, home: &Path) -> &Self {
        self.ok("id -u", "1000\n")
            .ok("id -un", "alice\n")
            .ok(
                "getent passwd alice",
                &format!("alice:x:1000:1000::{}:/bin/bash\n", home.display()),
            )
    }

    /// Root, as udev runs us, with `users` as the loginctl listing.
    pub fn as_root(&self, home: &Path, users: &str) -> &Self {
        self.ok("id -u", "0\n")
            .ok("loginctl list-users --no-legend", users)
            .ok(
                "getent passwd alice",
                &format!("alice:x:1000:1000::{}:/bin/bash\n", home.display()),
            )
    }

    /// JACK that reports stopped until started, and starts cleanly.
    pub fn jack_stopped(&self) -> &Self {
        self.answer(
            "jack_control status",
            vec![
                CommandOutput::ok("--- status\nstopped\n"),
                CommandOutput::ok("--- status\nstarted\n"),
            ],
        )
        .ok("jack_control start", "--- start\n")
        .ok("jack_control stop", "--- stop\n")
        .ok("jack_control ds alsa", "--- driver select\n")
    }

    pub fn calls_to(&self, program: &str) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.contains(program))
            .cloned()
            .collect()
    }

    /// Index of the first call ending with `tail`.
    pub fn position(&self, tail: &str) -> Option<usize> {
        self.calls.borrow().iter().position(|c| c.ends_with(tail))
    }
}

impl Host for ScriptedHost {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.borrow_mut().push(line.clone());

        let mut answers = self.answers.borrow_mut();
        let key = answers
            .keys()
            .filter(|k| line.ends_with(k.as_str()))
            .max_by_key(|k| k.len())
            .cloned();
        let Some(key) = key else {
            return Ok(CommandOutput::failed(1, ""));
        };
        let queue = answers.get_mut(&key).expect("key just found");
        let out = if queue.len() > 1 {
            queue.pop_front().expect("non-empty")
        } else {
            queue.front().cloned().unwrap_or_else(|| CommandOutput::failed(1, ""))
        };
        Ok(out)
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }

    fn exists(&self, path: &Path) -> bool {
        self.present.borrow().contains(path)
    }
}

/// Filesystem sandbox for one test: config dirs, trigger flag, shm and tmp.
pub struct Sandbox {
    pub dir: TempDir,
    pub settings: Settings,
    pub flag: FileFlag,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        for sub in ["etc", "home/alice", "shm", "tmp", "run"] {
            fs::create_dir_all(root.join(sub)).expect("mkdir");
        }
        let settings = Settings {
            system_config: root.join("etc/jackplug.conf"),
            trigger_flag: root.join("run/device-pending"),
            shm_dir: root.join("shm"),
            tmp_dir: root.join("tmp"),
            retry: RetryPolicy {
                backoff: Duration::from_millis(10),
                ..RetryPolicy::default()
            },
            ..Settings::default()
        };
        let flag = FileFlag::new(&settings.trigger_flag);
        Self {
            dir,
            settings,
            flag,
        }
    }

    pub fn home(&self) -> PathBuf {
        self.dir.path().join("home/alice")
    }

    pub fn write_system_config(&self, body: &str) {
        fs::write(&self.settings.system_config, body).expect("write config");
    }

    pub fn write_user_config(&self, body: &str) {
        let path = self.home().join(&self.settings.user_config);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, body).expect("write config");
    }
}
