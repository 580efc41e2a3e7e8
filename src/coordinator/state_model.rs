//! Built-in state model definitions

use crate::common::{Error, Record, Result};
use std::collections::BTreeMap;

pub const MASTER_SLAVE: &str = "MasterSlave";

pub const MASTER: &str = "MASTER";
pub const SLAVE: &str = "SLAVE";
pub const OFFLINE: &str = "OFFLINE";
pub const DROPPED: &str = "DROPPED";

pub const INITIAL_STATE: &str = "INITIAL_STATE";
pub const STATE_PRIORITY_LIST: &str = "STATE_PRIORITY_LIST";

/// Definition of the MasterSlave model.
///
/// - `INITIAL_STATE`: state a partition replica starts in
/// - `STATE_PRIORITY_LIST`: states from most to least preferred
/// - `STATE_TRANSITION_PRIORITYLIST`: order in which transitions are fired
/// - `{STATE}.meta`: `count` of replicas allowed in the state
///   (`R` = replica count, `-1` = unbounded)
/// - `{FROM}.next`: next hop from `FROM` towards each target state
pub fn master_slave() -> Record {
    let mut def = Record::new(MASTER_SLAVE);
    def.set_simple_field(INITIAL_STATE, OFFLINE);
    def.set_list_field(
        STATE_PRIORITY_LIST,
        [MASTER, SLAVE, OFFLINE, DROPPED].map(String::from).to_vec(),
    );
    def.set_list_field(
        "STATE_TRANSITION_PRIORITYLIST",
        [
            "MASTER-SLAVE",
            "SLAVE-MASTER",
            "OFFLINE-SLAVE",
            "SLAVE-OFFLINE",
            "OFFLINE-DROPPED",
        ]
        .map(String::from)
        .to_vec(),
    );

    for (state, count) in [(MASTER, "1"), (SLAVE, "R"), (OFFLINE, "-1"), (DROPPED, "-1")] {
        def.set_map_entry(format!("{}.meta", state), "count", count);
    }

    let next = [
        (MASTER, [(SLAVE, SLAVE), (OFFLINE, SLAVE), (DROPPED, SLAVE)]),
        (SLAVE, [(MASTER, MASTER), (OFFLINE, OFFLINE), (DROPPED, OFFLINE)]),
        (OFFLINE, [(SLAVE, SLAVE), (MASTER, SLAVE), (DROPPED, DROPPED)]),
    ];
    for (from, hops) in next {
        let hops: BTreeMap<String, String> = hops
            .iter()
            .map(|(to, via)| (to.to_string(), via.to_string()))
            .collect();
        def.set_map_field(format!("{}.next", from), hops);
    }

    def
}

/// Next state on the way from `from` to `to`, if the definition allows it.
pub fn next_hop<'a>(def: &'a Record, from: &str, to: &str) -> Option<&'a str> {
    def.map_field(&format!("{}.next", from))?
        .get(to)
        .map(String::as_str)
}

/// Check that every state of the priority list can be reached from the
/// initial state by following `next` hops.
pub fn validate(def: &Record) -> Result<()> {
    let invalid = |msg: String| Error::InvalidConfig(format!("state model {}: {}", def.id(), msg));

    let initial = def
        .simple_field(INITIAL_STATE)
        .ok_or_else(|| invalid(format!("missing {}", INITIAL_STATE)))?;
    let states = def
        .list_field(STATE_PRIORITY_LIST)
        .ok_or_else(|| invalid(format!("missing {}", STATE_PRIORITY_LIST)))?;

    for target in states {
        let mut current = initial;
        for _ in 0..states.len() {
            if current == target.as_str() {
                break;
            }
            current = next_hop(def, current, target)
                .ok_or_else(|| invalid(format!("no transition from {} towards {}", current, target)))?;
        }
        if current != target.as_str() {
            return Err(invalid(format!("{} never reaches {}", initial, target)));
        }
    }
    Ok(())
}

/// State a replica at `position` of a preference list is expected to reach
pub fn target_state(position: usize) -> &'static str {
    if position == 0 {
        MASTER
    } else {
        SLAVE
    }
}
