//! Store path layout for a cluster
//!
//! ```text
//! /{cluster}                                   cluster root
//! /{cluster}/CONFIGS/{node}                    instance config
//! /{cluster}/IDEALSTATES/{resource}            ideal state (placement)
//! /{cluster}/STATEMODELDEFS/{model}            state model definition
//! /{cluster}/CURRENTSTATES/{node}/{resource}   reported partition states
//! /{cluster}/LIVEINSTANCES/{node}              participant liveness
//! ```

pub const CONFIGS: &str = "CONFIGS";
pub const IDEAL_STATES: &str = "IDEALSTATES";
pub const STATE_MODEL_DEFS: &str = "STATEMODELDEFS";
pub const CURRENT_STATES: &str = "CURRENTSTATES";
pub const LIVE_INSTANCES: &str = "LIVEINSTANCES";

pub fn cluster(cluster: &str) -> String {
    format!("/{}", cluster)
}

pub fn configs(cluster: &str) -> String {
    format!("/{}/{}", cluster, CONFIGS)
}

pub fn instance_config(cluster: &str, node: &str) -> String {
    format!("/{}/{}/{}", cluster, CONFIGS, node)
}

pub fn ideal_states(cluster: &str) -> String {
    format!("/{}/{}", cluster, IDEAL_STATES)
}

pub fn ideal_state(cluster: &str, resource: &str) -> String {
    format!("/{}/{}/{}", cluster, IDEAL_STATES, resource)
}

pub fn state_model_def(cluster: &str, model: &str) -> String {
    format!("/{}/{}/{}", cluster, STATE_MODEL_DEFS, model)
}

pub fn current_state(cluster: &str, node: &str, resource: &str) -> String {
    format!("/{}/{}/{}/{}", cluster, CURRENT_STATES, node, resource)
}

pub fn live_instance(cluster: &str, node: &str) -> String {
    format!("/{}/{}/{}", cluster, LIVE_INSTANCES, node)
}

/// Reject names that would break the path layout
pub fn validate_name(kind: &str, name: &str) -> crate::Result<()> {
    if name.is_empty() || name.contains('/') || name.chars().any(char::is_control) {
        return Err(crate::Error::InvalidConfig(format!(
            "invalid {} name: {:?}",
            kind, name
        )));
    }
    Ok(())
}
