//! Watches udev for sound cards coming and going and runs the matching entry
//! point, for setups without a udev rule.
use anyhow::{Context, Result};
use std::{ffi::OsStr, thread, time::Duration};
use udev::{EventType, MonitorBuilder};

use crate::events::Runtime;

/// udev reports the card before its PCM nodes are usable.
const SETTLE: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(500);

/// `card3` yes, `pcmC3D0p` / `controlC3` no.
pub fn is_card_node(sysname: &OsStr) -> bool {
    sysname
        .to_str()
        .and_then(|s| s.strip_prefix("card"))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Blocks forever, dispatching card add/remove events. A failed dispatch is
/// logged and the watch goes on.
pub fn watch(rt: &Runtime<'_>) -> Result<()> {
    let socket = MonitorBuilder::new()
        .and_then(|b| b.match_subsystem("sound"))
        .and_then(|b| b.listen())
        .context("failed to open udev monitor")?;
    log::info!("🔌 Watching for sound cards");

    loop {
        for event in socket.iter() {
            if !is_card_node(event.sysname()) {
                continue;
            }
            let name = event.sysname().to_string_lossy().into_owned();
            let result = match event.event_type() {
                EventType::Add => {
                    log::info!("🎛 {name} added");
                    thread::sleep(SETTLE);
                    rt.device_added()
                }
                EventType::Remove => {
                    log::info!("🎛 {name} removed");
                    thread::sleep(SETTLE);
                    rt.device_removed()
                }
                _ => continue,
            };
            match result {
                Ok(outcome) => log::info!("{name}: {outcome:?}"),
                Err(e) => log::error!("{name}: {e}"),
            }
        }
        thread::sleep(POLL);
    }
}
