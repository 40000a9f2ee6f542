//! Sound card enumeration via `aplay -l` and the internal / external split.

use regex::Regex;
use std::sync::LazyLock;

use crate::{
    config::EffectiveConfig,
    error::{Error, Result},
    invoke::{Host, InvokeError},
    params::DeviceIdentity,
};

/// Substrings (lower-case) of card ids / names that identify onboard, HDMI and
/// chipset audio. Such cards are never auto-selected.
pub const INTERNAL_CARD_PATTERNS: &[&str] = &[
    "pch",
    "hdmi",
    "hda intel",
    "hda-intel",
    "hd-audio generic",
    "nvidia",
    "sofhda",
    "sof-",
    "bcm2835",
    "vc4",
    "loopback",
    "dummy",
];

static CARD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^card (\d+): (\S+) \[([^\]]*)\](?:, device (\d+):)?").expect("valid regex")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Card {
    pub number: u32,
    pub id: String,
    pub name: String,
    /// First playback device listed for the card.
    pub device: u32,
}

impl Card {
    pub fn is_internal(&self) -> bool {
        let id = self.id.to_lowercase();
        let name = self.name.to_lowercase();
        INTERNAL_CARD_PATTERNS
            .iter()
            .any(|p| id.contains(p) || name.contains(p))
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.id, self.device)
    }

    fn matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.id.to_lowercase().contains(&needle) || self.name.to_lowercase().contains(&needle)
    }
}

/// Parses `aplay -l` output. Cards keep listing order; repeated lines for
/// additional devices of a card are folded into the first.
pub fn parse_listing(text: &str) -> Vec<Card> {
    let mut cards: Vec<Card> = Vec::new();
    for line in text.lines() {
        let Some(caps) = CARD_LINE.captures(line.trim_start()) else {
            continue;
        };
        let Ok(number) = caps[1].parse::<u32>() else {
            continue;
        };
        if cards.iter().any(|c| c.number == number) {
            continue;
        }
        cards.push(Card {
            number,
            id: caps[2].to_string(),
            name: caps[3].to_string(),
            device: caps.get(4).and_then(|m| m.as_str().parse().ok()).unwrap_or(0),
        });
    }
    cards
}

/// Runs the hardware listing once. A listing that reports no cards at all
/// (`aplay` exits 1 with "no soundcards found") is an empty list, not an error.
pub fn list_cards(host: &dyn Host) -> Result<Vec<Card>> {
    let out = host
        .run("aplay", &["-l".to_string()])
        .map_err(|source| {
            Error::Listing(InvokeError::Spawn {
                program: "aplay".into(),
                source,
            })
        })?;

    if !out.success() && !out.text.to_lowercase().contains("no soundcards found") {
        return Err(Error::Listing(InvokeError::Exit {
            code: out.code,
            output: out.text,
        }));
    }
    Ok(parse_listing(&out.text))
}

pub fn detect_external(cards: &[Card]) -> Option<DeviceIdentity> {
    cards.iter().find(|c| !c.is_internal()).map(Card::identity)
}

pub fn any_external_present(cards: &[Card]) -> bool {
    cards.iter().any(|c| !c.is_internal())
}

/// Whether a previously configured device is still in the listing, by card id
/// or by card number.
pub fn is_available(device: &DeviceIdentity, cards: &[Card]) -> bool {
    cards.iter().any(|c| {
        c.id.eq_ignore_ascii_case(&device.card_id) || c.number.to_string() == device.card_id
    })
}

/// Picks the device JACK should run on for this run.
///
/// A pinned device wins while present; a missing one falls back to the
/// pattern and then to the first external card, for this run only.
pub fn select_device(config: &EffectiveConfig, cards: &[Card]) -> Result<DeviceIdentity> {
    let pattern = config.device_pattern.as_ref().map(|p| p.value.clone());

    if let Some(pinned) = &config.device {
        if is_available(&pinned.value, cards) {
            log::info!("using pinned device {} ({})", pinned.value, pinned.layer);
            return Ok(pinned.value.clone().with_pattern(pattern));
        }
        log::warn!(
            "pinned device {} ({}) is not connected, falling back to detection",
            pinned.value,
            pinned.layer
        );
    }

    if let Some(p) = &pattern {
        if let Some(card) = cards.iter().find(|c| c.matches(p)) {
            log::info!("device pattern {p:?} matched card {} [{}]", card.id, card.name);
            return Ok(card.identity().with_pattern(pattern.clone()));
        }
        log::debug!("device pattern {p:?} matched no card");
    }

    match detect_external(cards) {
        Some(found) => {
            log::info!("auto-detected external device {found}");
            Ok(found.with_pattern(pattern))
        }
        None => Err(Error::NoDevice),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Layer, Sourced};

    const LAPTOP_ONLY: &str = "\
**** List of PLAYBACK Hardware Devices ****
card 0: PCH [HDA Intel PCH], device 0: ALC3246 Analog [ALC3246 Analog]
  Subdevices: 1/1
  Subdevice #0: subdevice #0
card 0: PCH [HDA Intel PCH], device 3: HDMI 0 [HDMI 0]
  Subdevices: 1/1
  Subdevice #0: subdevice #0
card 1: NVidia [HDA NVidia], device 3: HDMI 0 [HDMI 0]
  Subdevices: 1/1
";

    const WITH_USB: &str = "\
**** List of PLAYBACK Hardware Devices ****
card 0: PCH [HDA Intel PCH], device 0: ALC3246 Analog [ALC3246 Analog]
  Subdevices: 1/1
card 1: M4 [M4], device 0: USB Audio [USB Audio]
  Subdevices: 1/1
card 2: Focusrite [Scarlett 2i2 USB], device 0: USB Audio [USB Audio]
  Subdevices: 1/1
";

    #[test]
    fn parses_and_folds_devices() {
        let cards = parse_listing(LAPTOP_ONLY);
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].id, "PCH");
        assert_eq!(cards[0].name, "HDA Intel PCH");
        assert_eq!(cards[0].device, 0);
        assert_eq!(cards[1].device, 3);
    }

    #[test]
    fn only_internal_cards_yield_nothing() {
        let cards = parse_listing(LAPTOP_ONLY);
        assert!(cards.iter().all(Card::is_internal));
        assert_eq!(detect_external(&cards), None);
        assert!(!any_external_present(&cards));
    }

    #[test]
    fn first_external_in_listing_order_wins() {
        let cards = parse_listing(WITH_USB);
        let found = detect_external(&cards).unwrap();
        assert_eq!(found.card_id, "M4");
        assert_eq!(found.device_path, "hw:M4,0");

        let reordered: Vec<Card> = cards.iter().rev().cloned().collect();
        assert_eq!(detect_external(&reordered).unwrap().card_id, "Focusrite");
    }

    #[test]
    fn availability_by_id_or_number() {
        let cards = parse_listing(WITH_USB);
        assert!(is_available(&DeviceIdentity::parse("hw:m4,0").unwrap(), &cards));
        assert!(is_available(&DeviceIdentity::parse("hw:2,0").unwrap(), &cards));
        assert!(!is_available(&DeviceIdentity::parse("hw:Babyface").unwrap(), &cards));
    }

    fn config_with(device: Option<&str>, pattern: Option<&str>) -> EffectiveConfig {
        let mut cfg = EffectiveConfig::default();
        cfg.device = device.map(|d| Sourced {
            value: DeviceIdentity::parse(d).unwrap(),
            layer: Layer::System,
        });
        cfg.device_pattern = pattern.map(|p| Sourced {
            value: p.to_string(),
            layer: Layer::User,
        });
        cfg
    }

    #[test]
    fn pinned_device_wins_while_present() {
        let cards = parse_listing(WITH_USB);
        let d = select_device(&config_with(Some("hw:Focusrite,0"), None), &cards).unwrap();
        assert_eq!(d.card_id, "Focusrite");
    }

    #[test]
    fn missing_pin_falls_back_to_detection() {
        let cards = parse_listing(WITH_USB);
        let d = select_device(&config_with(Some("hw:Babyface,0"), None), &cards).unwrap();
        assert_eq!(d.card_id, "M4");
    }

    #[test]
    fn pattern_matches_card_name() {
        let cards = parse_listing(WITH_USB);
        let d = select_device(&config_with(None, Some("scarlett")), &cards).unwrap();
        assert_eq!(d.card_id, "Focusrite");
        assert_eq!(d.match_pattern.as_deref(), Some("scarlett"));
    }

    #[test]
    fn nothing_external_is_fatal() {
        let cards = parse_listing(LAPTOP_ONLY);
        let err = select_device(&config_with(None, None), &cards).unwrap_err();
        assert!(matches!(err, Error::NoDevice));
    }
}
