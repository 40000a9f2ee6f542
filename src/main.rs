use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::{Env, Target};
use std::{fs::OpenOptions, path::PathBuf, process::ExitCode};

use jackplug::{
    config::Settings,
    detect,
    events::{Outcome, Runtime},
    invoke::{self, SystemHost},
    jack_boot::{self, Lifecycle},
    monitor,
    session,
    trigger::FileFlag,
};

#[derive(Parser)]
#[command(name = "jackplug", version, about = "Run JACK on whatever USB audio interface is plugged in")]
struct Cli {
    /// System config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append log output to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// A sound card was plugged in (udev add).
    Added,
    /// A sound card was unplugged (udev remove).
    Removed,
    /// After login: start JACK if a device is waiting.
    LoginCheck,
    /// Stop everything and start JACK again with the current config.
    Restart,
    /// Show the effective config, cards and server state.
    Status,
    /// List sound cards and how they are classified.
    Detect,
    /// Follow udev sound events until killed.
    Watch,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level));
    if let Some(path) = &cli.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("jackplug: {e:#}");
        return ExitCode::FAILURE;
    }

    let mut settings = Settings::default();
    if let Some(path) = &cli.config {
        settings.system_config = path.clone();
    }
    let flag = FileFlag::new(&settings.trigger_flag);
    let rt = Runtime {
        host: &SystemHost,
        flags: &flag,
        settings: &settings,
        env: std::env::vars().collect(),
    };

    match run(&cli.command, &rt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<jackplug::Error>() {
                Some(err) => log::error!("[{}] {e:#}", err.as_label()),
                None => log::error!("{e:#}"),
            }
            eprintln!("jackplug: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cmd: &Cmd, rt: &Runtime<'_>) -> Result<()> {
    let outcome = match cmd {
        Cmd::Added => rt.device_added()?,
        Cmd::Removed => rt.device_removed()?,
        Cmd::LoginCheck => rt.login_check()?,
        Cmd::Restart => rt.restart()?,
        Cmd::Status => return status(rt),
        Cmd::Detect => return list(rt),
        Cmd::Watch => return monitor::watch(rt),
    };
    match outcome {
        Outcome::Started(device) => log::info!("✅ JACK running on {device}"),
        Outcome::Stopped => log::info!("JACK stopped"),
        Outcome::Deferred => log::info!("waiting for a user to log in"),
        Outcome::Nothing => log::info!("nothing to do"),
    }
    Ok(())
}

fn list(rt: &Runtime<'_>) -> Result<()> {
    let cards = detect::list_cards(rt.host)?;
    for card in &cards {
        let kind = if card.is_internal() { "internal" } else { "external" };
        println!("card {}: {} [{}] {kind} -> hw:{},{}", card.number, card.id, card.name, card.id, card.device);
    }
    if !detect::any_external_present(&cards) {
        anyhow::bail!(jackplug::Error::NoDevice);
    }
    Ok(())
}

fn status(rt: &Runtime<'_>) -> Result<()> {
    let Some(ctx) = session::acting_context(rt.host)? else {
        println!("no user logged in");
        return list(rt);
    };
    println!("user: {} (uid {}){}", ctx.user.name, ctx.user.uid, if ctx.elevated { ", via runuser" } else { "" });

    let plan = rt.plan(&ctx)?;
    for line in plan.config.describe() {
        println!("  {line}");
    }
    for w in &plan.config.warnings {
        println!("  warning: {w}");
    }
    println!("latency: {:.2} ms", plan.config.params().latency_ms());

    for card in &plan.cards {
        let kind = if card.is_internal() { "internal" } else { "external" };
        println!("card {}: {} [{}] {kind}", card.number, card.id, card.name);
    }
    match &plan.device {
        Ok(device) => println!("target: {device}"),
        Err(e) => println!("target: none ({e})"),
    }

    let lifecycle = Lifecycle::new(rt.host, &ctx, rt.settings);
    println!("jack: {:?}", lifecycle.jack_state());
    println!("a2j: {:?}", lifecycle.bridge_state());
    if !ctx.elevated {
        println!("accepting clients: {}", jack_boot::jack_accepts_clients());
    }
    println!("pending trigger: {}", rt.flags.is_set());
    println!("bus classifier: revision {}", invoke::BUS_SIGNATURES_VERSION);
    Ok(())
}
