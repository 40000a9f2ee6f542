//! Who JACK runs for, and how commands reach that user's session.
//!
//! udev runs us as root while JACK and the session bus belong to the desktop
//! user. When the process is root, control commands are wrapped in
//! `runuser ... env XDG_RUNTIME_DIR=... DBUS_SESSION_BUS_ADDRESS=...`.

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use crate::{
    error::{Error, Result},
    invoke::{CommandOutput, Host},
};

/// Accounts below this uid are system users and never own a desktop session.
const FIRST_LOGIN_UID: u32 = 1000;
const NOBODY_UID: u32 = 65534;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserSession {
    pub name: String,
    pub uid: u32,
    pub home: Option<PathBuf>,
}

impl UserSession {
    pub fn runtime_dir(&self) -> PathBuf {
        PathBuf::from(format!("/run/user/{}", self.uid))
    }

    pub fn bus_socket(&self) -> PathBuf {
        self.runtime_dir().join("bus")
    }

    pub fn bus_address(&self) -> String {
        format!("unix:path={}", self.bus_socket().display())
    }
}

/// The user a run acts for, and whether we cross from root to reach them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActingContext {
    pub user: UserSession,
    pub elevated: bool,
}

impl ActingContext {
    /// Program and arguments that run `program` inside the user's session.
    pub fn wrap(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        if !self.elevated {
            return (program.to_string(), args.to_vec());
        }
        let mut wrapped = vec![
            "-u".to_string(),
            self.user.name.clone(),
            "--".to_string(),
            "env".to_string(),
            format!("XDG_RUNTIME_DIR={}", self.user.runtime_dir().display()),
            format!("DBUS_SESSION_BUS_ADDRESS={}", self.user.bus_address()),
            program.to_string(),
        ];
        wrapped.extend_from_slice(args);
        ("runuser".to_string(), wrapped)
    }
}

fn run_text(host: &dyn Host, program: &str, args: &[&str]) -> Result<CommandOutput> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    host.run(program, &args)
        .map_err(|e| Error::Session(format!("{program}: {e}")))
}

/// Parses `loginctl list-users --no-legend`: `UID USER [LINGER STATE]`.
pub fn parse_login_users(text: &str) -> Vec<(u32, String)> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let uid = cols.next()?.parse().ok()?;
            let name = cols.next()?.to_string();
            Some((uid, name))
        })
        .filter(|(uid, _)| *uid >= FIRST_LOGIN_UID && *uid != NOBODY_UID)
        .collect()
}

/// Home directory field of a `getent passwd` line.
pub fn parse_passwd_home(text: &str) -> Option<PathBuf> {
    let line = text.lines().next()?;
    let home = line.split(':').nth(5)?;
    (!home.is_empty()).then(|| PathBuf::from(home))
}

fn home_of(host: &dyn Host, name: &str) -> Option<PathBuf> {
    let out = run_text(host, "getent", &["passwd", name]).ok()?;
    out.success().then(|| parse_passwd_home(&out.text)).flatten()
}

/// First logged-in desktop user, if any.
pub fn find_login_user(host: &dyn Host) -> Result<Option<UserSession>> {
    let out = run_text(host, "loginctl", &["list-users", "--no-legend"])?;
    if !out.success() {
        return Err(Error::Session(format!("loginctl: {}", out.text.trim())));
    }
    Ok(parse_login_users(&out.text)
        .into_iter()
        .next()
        .map(|(uid, name)| UserSession {
            home: home_of(host, &name),
            name,
            uid,
        }))
}

fn current_uid(host: &dyn Host) -> Result<u32> {
    let out = run_text(host, "id", &["-u"])?;
    out.text
        .trim()
        .parse()
        .map_err(|_| Error::Session(format!("unexpected `id -u` output {:?}", out.text)))
}

/// Works out who this run acts for. Non-root processes act for themselves;
/// root acts for the logged-in user, or nobody.
pub fn acting_context(host: &dyn Host) -> Result<Option<ActingContext>> {
    let uid = current_uid(host)?;
    if uid != 0 {
        let out = run_text(host, "id", &["-un"])?;
        let name = out.text.trim().to_string();
        return Ok(Some(ActingContext {
            user: UserSession {
                home: home_of(host, &name),
                name,
                uid,
            },
            elevated: false,
        }));
    }
    Ok(find_login_user(host)?.map(|user| ActingContext {
        user,
        elevated: true,
    }))
}

/// Polls for a login session until `ceiling`; running out is fatal.
pub fn wait_for_login(host: &dyn Host, ceiling: Duration, poll: Duration) -> Result<ActingContext> {
    let start = Instant::now();
    let mut waited = Duration::ZERO;
    loop {
        if let Some(ctx) = acting_context(host)? {
            return Ok(ctx);
        }
        // `waited` keeps the bound honest when `sleep` is not a real sleep
        if waited >= ceiling || start.elapsed() >= ceiling {
            return Err(Error::NoUserSession(ceiling));
        }
        log::info!("no user logged in yet, checking again in {poll:?}");
        host.sleep(poll);
        waited += poll;
    }
}

/// Polls for the user's bus socket. Returns false when the ceiling passes;
/// callers continue anyway and let the invoker's retries absorb the rest.
pub fn wait_for_bus(host: &dyn Host, user: &UserSession, ceiling: Duration, poll: Duration) -> bool {
    let socket = user.bus_socket();
    let mut waited = Duration::ZERO;
    while !host.exists(&socket) {
        if waited >= ceiling {
            log::warn!(
                "session bus {} did not appear within {ceiling:?}, continuing",
                socket.display()
            );
            return false;
        }
        host.sleep(poll);
        waited += poll;
    }
    true
}
