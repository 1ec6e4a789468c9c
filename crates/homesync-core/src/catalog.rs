// ── State variable catalog ──
//
// The closed set of variables the store knows about. Every read and
// write is validated against the kind declared here.

use std::collections::HashMap;

use serde_json::{Map, Value};
use strum::{Display, EnumString};
use tracing::warn;

use crate::value::StateValue;

/// Value kind a variable is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Number,
    String,
    Structured,
}

/// Value a variable starts from before the hub has reported one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Seed {
    Bool(bool),
    Number(f64),
    Text(&'static str),
    EmptyObject,
}

impl Seed {
    pub fn kind(self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::Text(_) => ValueKind::String,
            Self::EmptyObject => ValueKind::Structured,
        }
    }

    pub fn to_value(self) -> StateValue {
        match self {
            Self::Bool(b) => StateValue::Bool(b),
            Self::Number(n) => StateValue::Number(n),
            Self::Text(s) => StateValue::Text(s.to_owned()),
            Self::EmptyObject => StateValue::Structured(Value::Object(Map::new())),
        }
    }
}

/// One catalog entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateVariable {
    pub key: &'static str,
    /// Hub entity this variable mirrors. `None` for local-only variables.
    pub entity_id: Option<&'static str>,
    pub default: Seed,
    /// Lives only in memory; never hydrated from or pushed to the hub.
    pub local_only: bool,
}

impl StateVariable {
    pub const fn boolean(key: &'static str, entity_id: &'static str, default: bool) -> Self {
        Self::synced(key, entity_id, Seed::Bool(default))
    }

    pub const fn number(key: &'static str, entity_id: &'static str, default: f64) -> Self {
        Self::synced(key, entity_id, Seed::Number(default))
    }

    pub const fn text(key: &'static str, entity_id: &'static str, default: &'static str) -> Self {
        Self::synced(key, entity_id, Seed::Text(default))
    }

    /// A structured variable kept in memory only, seeded with `{}`.
    pub const fn local_structured(key: &'static str) -> Self {
        Self {
            key,
            entity_id: None,
            default: Seed::EmptyObject,
            local_only: true,
        }
    }

    const fn synced(key: &'static str, entity_id: &'static str, default: Seed) -> Self {
        Self {
            key,
            entity_id: Some(entity_id),
            default,
            local_only: false,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.default.kind()
    }

    /// Split the entity id into `(domain, object name)`, e.g.
    /// `input_boolean.tv_on` → `("input_boolean", "tv_on")`.
    pub fn entity_parts(&self) -> Option<(&'static str, &'static str)> {
        self.entity_id.and_then(|id| id.split_once('.'))
    }
}

// ── Catalog ─────────────────────────────────────────────────────────

/// Indexed, immutable set of [`StateVariable`]s.
#[derive(Debug, Clone)]
pub struct Catalog {
    variables: Vec<StateVariable>,
    by_key: HashMap<&'static str, usize>,
    by_entity: HashMap<&'static str, usize>,
}

impl Catalog {
    /// Build a catalog. A repeated key keeps its first definition.
    pub fn new(variables: impl IntoIterator<Item = StateVariable>) -> Self {
        let mut catalog = Self {
            variables: Vec::new(),
            by_key: HashMap::new(),
            by_entity: HashMap::new(),
        };

        for variable in variables {
            if catalog.by_key.contains_key(variable.key) {
                warn!(key = variable.key, "duplicate state variable ignored");
                continue;
            }
            let index = catalog.variables.len();
            catalog.by_key.insert(variable.key, index);
            if let Some(entity_id) = variable.entity_id {
                catalog.by_entity.insert(entity_id, index);
            }
            catalog.variables.push(variable);
        }

        catalog
    }

    /// The daemon's standard variable set.
    pub fn standard() -> Self {
        Self::new(STANDARD_VARIABLES.iter().copied())
    }

    pub fn get(&self, key: &str) -> Option<&StateVariable> {
        self.by_key.get(key).map(|&i| &self.variables[i])
    }

    pub fn by_entity_id(&self, entity_id: &str) -> Option<&StateVariable> {
        self.by_entity.get(entity_id).map(|&i| &self.variables[i])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Variables in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &StateVariable> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}

// ── Standard variables ──────────────────────────────────────────────

pub const STANDARD_VARIABLES: &[StateVariable] = &[
    // Presence and sleep
    StateVariable::boolean("isNickHome", "input_boolean.nick_home", false),
    StateVariable::boolean("isCarolineHome", "input_boolean.caroline_home", false),
    StateVariable::boolean("isToriHere", "input_boolean.tori_here", false),
    StateVariable::boolean("isAnyOwnerHome", "input_boolean.any_owner_home", false),
    StateVariable::boolean("isAnyoneHome", "input_boolean.anyone_home", false),
    StateVariable::boolean("isMasterAsleep", "input_boolean.master_asleep", false),
    StateVariable::boolean("isGuestAsleep", "input_boolean.guest_asleep", false),
    StateVariable::boolean("isAnyoneAsleep", "input_boolean.anyone_asleep", false),
    StateVariable::boolean("isEveryoneAsleep", "input_boolean.everyone_asleep", false),
    StateVariable::boolean("isGuestBedroomDoorOpen", "input_boolean.guest_bedroom_door_open", false),
    StateVariable::boolean("isHaveGuests", "input_boolean.have_guests", false),
    // Media
    StateVariable::boolean("isAppleTVPlaying", "input_boolean.apple_tv_playing", false),
    StateVariable::boolean("isTVPlaying", "input_boolean.tv_playing", false),
    StateVariable::boolean("isTVon", "input_boolean.tv_on", false),
    StateVariable::boolean("isFadeOutInProgress", "input_boolean.fade_out_in_progress", false),
    // Energy
    StateVariable::boolean("isFreeEnergyAvailable", "input_boolean.free_energy_available", false),
    StateVariable::boolean("isGridAvailable", "input_boolean.grid_available", true),
    StateVariable::boolean("isExpectingSomeone", "input_boolean.expecting_someone", false),
    // Numbers
    StateVariable::number("alarmTime", "input_number.alarm_time", 0.0),
    StateVariable::number("remainingSolarGeneration", "input_number.remaining_solar_generation", 0.0),
    StateVariable::number("thisHourSolarGeneration", "input_number.this_hour_solar_generation", 0.0),
    // Text
    StateVariable::text("dayPhase", "input_text.day_phase", ""),
    StateVariable::text("sunevent", "input_text.sun_event", ""),
    StateVariable::text("musicPlaybackType", "input_text.music_playback_type", ""),
    StateVariable::text("batteryEnergyLevel", "input_text.battery_energy_level", ""),
    StateVariable::text("currentEnergyLevel", "input_text.current_energy_level", ""),
    StateVariable::text("solarProductionEnergyLevel", "input_text.solar_production_energy_level", ""),
    // Local only
    StateVariable::local_structured("currentlyPlayingMusic"),
];
