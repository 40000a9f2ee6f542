//! The four ways a run starts: a card was plugged in, a card was removed, a
//! user logged in, or someone asked for a restart.

use crate::{
    config::{self, EffectiveConfig, Settings},
    detect::{self, Card},
    error::{Error, Result},
    invoke::Host,
    jack_boot::Lifecycle,
    params::DeviceIdentity,
    session::{self, ActingContext},
    trigger::FlagStore,
};

/// What a run did, for the caller's final log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Started(DeviceIdentity),
    Stopped,
    /// Nobody to run JACK for yet; the trigger flag was left for login.
    Deferred,
    Nothing,
}

/// Everything a run needs from outside, injected.
pub struct Runtime<'a> {
    pub host: &'a dyn Host,
    pub flags: &'a dyn FlagStore,
    pub settings: &'a Settings,
    pub env: Vec<(String, String)>,
}

/// Config, cards and target device for one acting user.
pub struct Plan {
    pub config: EffectiveConfig,
    pub cards: Vec<Card>,
    pub device: Result<DeviceIdentity>,
}

impl Runtime<'_> {
    pub fn resolve_config(&self, ctx: &ActingContext) -> EffectiveConfig {
        let sources = self
            .settings
            .sources_for(ctx.user.home.as_deref())
            .with_env(self.env.iter().cloned());
        let cfg = config::resolve(&sources);
        for line in cfg.describe() {
            log::debug!("config: {line}");
        }
        for w in &cfg.warnings {
            log::warn!("config: {w}");
        }
        cfg
    }

    pub fn plan(&self, ctx: &ActingContext) -> Result<Plan> {
        let config = self.resolve_config(ctx);
        let cards = detect::list_cards(self.host)?;
        let device = detect::select_device(&config, &cards);
        Ok(Plan {
            config,
            cards,
            device,
        })
    }

    fn lifecycle<'b>(&'b self, ctx: &'b ActingContext) -> Lifecycle<'b> {
        Lifecycle::new(self.host, ctx, self.settings)
    }

    fn wait_for_bus(&self, ctx: &ActingContext, config: &EffectiveConfig) {
        if ctx.elevated {
            session::wait_for_bus(
                self.host,
                &ctx.user,
                config.dbus_timeout.value,
                self.settings.bus_poll,
            );
        }
    }

    /// Selects the device, then reconfigures and starts JACK and the bridge.
    /// Device selection happens before any JACK call, so a missing device
    /// leaves JACK untouched.
    fn bring_up(&self, ctx: &ActingContext) -> Result<Outcome> {
        let plan = self.plan(ctx)?;
        let device = plan.device?;
        self.wait_for_bus(ctx, &plan.config);

        let params = plan.config.params();
        let lifecycle = self.lifecycle(ctx);
        lifecycle.ensure_configured(&params, &device)?;
        if let Err(e) = lifecycle.ensure_bridge(params.midi_bridge) {
            log::warn!("a2j bridge: {e}");
        }
        Ok(Outcome::Started(device))
    }

    pub fn device_added(&self) -> Result<Outcome> {
        let Some(ctx) = session::acting_context(self.host)? else {
            log::info!("device added before login, leaving trigger for the login check");
            self.flags.set()?;
            return Ok(Outcome::Deferred);
        };
        log::info!("device added, acting for {}", ctx.user.name);
        self.bring_up(&ctx)
    }

    pub fn device_removed(&self) -> Result<Outcome> {
        let Some(ctx) = session::acting_context(self.host)? else {
            log::info!("device removed with nobody logged in, nothing to do");
            return Ok(Outcome::Nothing);
        };

        let cards = detect::list_cards(self.host)?;
        if detect::any_external_present(&cards) {
            log::info!("an external device is still connected, reconfiguring");
            return self.bring_up(&ctx);
        }

        log::info!("no external device left, shutting JACK down");
        self.lifecycle(&ctx).shutdown_all()?;
        Ok(Outcome::Stopped)
    }

    pub fn login_check(&self) -> Result<Outcome> {
        let ctx = session::wait_for_login(
            self.host,
            self.settings.login_wait,
            self.settings.login_poll,
        )?;

        let triggered = self.flags.is_set();
        if let Err(e) = self.flags.clear() {
            log::warn!("could not clear trigger flag, later logins will see it as pending: {e}");
        }

        if triggered {
            log::info!("device arrived before login, starting JACK for {}", ctx.user.name);
            return self.bring_up(&ctx);
        }
        let cards = detect::list_cards(self.host)?;
        if detect::any_external_present(&cards) {
            log::info!("external device present at login, starting JACK for {}", ctx.user.name);
            return self.bring_up(&ctx);
        }
        log::info!("no external device at login, nothing to do");
        Ok(Outcome::Nothing)
    }

    pub fn restart(&self) -> Result<Outcome> {
        let ctx = session::acting_context(self.host)?.ok_or(Error::NoActingUser)?;
        let plan = self.plan(&ctx)?;
        let device = plan.device?;
        self.wait_for_bus(&ctx, &plan.config);

        log::info!("restarting JACK for {} on {device}", ctx.user.name);
        self.lifecycle(&ctx).restart(&plan.config.params(), &device)?;
        Ok(Outcome::Started(device))
    }
}
