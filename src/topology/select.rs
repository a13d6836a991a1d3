//! Pure server-selection functions. Given a topology snapshot and a
//! criterion these decide which servers are eligible; the caller picks one
//! of them at random and retries against newer snapshots when none qualify.
use common::{ReadMode, ReadPreference, SelectionCriterion};

use std::collections::BTreeMap;

use super::{TopologyDescription, TopologyType};
use super::server::{ServerDescription, ServerType};

/// Returns the servers that satisfy the criterion, before latency windowing.
pub fn suitable_servers<'a>(description: &'a TopologyDescription,
                            criterion: &SelectionCriterion) -> Vec<&'a ServerDescription> {
    match criterion {
        &SelectionCriterion::Writable => writable_servers(description),
        &SelectionCriterion::Readable(ref preference) => {
            readable_servers(description, preference)
        }
    }
}

/// Returns the servers a write can run against: the standalone server, any
/// mongos, or the replica set primary.
pub fn writable_servers(description: &TopologyDescription) -> Vec<&ServerDescription> {
    match description.topology_type {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single | TopologyType::Sharded => {
            servers_of_types(description,
                             &[ServerType::Standalone, ServerType::Mongos,
                               ServerType::RSPrimary])
        }
        TopologyType::ReplicaSetNoPrimary |
        TopologyType::ReplicaSetWithPrimary => {
            servers_of_types(description, &[ServerType::RSPrimary])
        }
    }
}

/// Returns the servers a read with the given preference can run against.
/// Each mode defines a fallback order; tag sets further filter the
/// secondary half of the candidates.
pub fn readable_servers<'a>(description: &'a TopologyDescription,
                            preference: &ReadPreference) -> Vec<&'a ServerDescription> {
    match description.topology_type {
        TopologyType::Unknown => return Vec::new(),
        // For single servers and shard routers the read preference is
        // forwarded with the operation rather than applied here.
        TopologyType::Single | TopologyType::Sharded => {
            return known_servers(description);
        }
        _ => (),
    }

    let primaries = servers_of_types(description, &[ServerType::RSPrimary]);
    let secondaries = filter_by_tag_sets(
        servers_of_types(description, &[ServerType::RSSecondary]),
        &preference.tag_sets);

    match preference.mode {
        ReadMode::Primary => primaries,
        ReadMode::PrimaryPreferred => {
            if !primaries.is_empty() { primaries } else { secondaries }
        }
        ReadMode::Secondary => secondaries,
        ReadMode::SecondaryPreferred => {
            if !secondaries.is_empty() { secondaries } else { primaries }
        }
        ReadMode::Nearest => {
            let mut nearest = servers_of_types(description,
                                               &[ServerType::RSPrimary,
                                                 ServerType::RSSecondary]);
            nearest = filter_by_tag_sets(nearest, &preference.tag_sets);
            nearest
        }
    }
}

/// Keeps only the servers within `local_threshold_ms` of the fastest
/// candidate. A server without a round-trip sample yet is treated as
/// fastest rather than excluded; it has just been discovered.
pub fn within_latency_window<'a>(servers: Vec<&'a ServerDescription>,
                                 local_threshold_ms: u64) -> Vec<&'a ServerDescription> {
    let minimum = servers.iter()
        .map(|server| server.round_trip_time.unwrap_or(0.0))
        .fold(None, |lowest: Option<f64>, rtt| match lowest {
            Some(lowest) if lowest <= rtt => Some(lowest),
            _ => Some(rtt),
        });

    let minimum = match minimum {
        Some(minimum) => minimum,
        None => return Vec::new(),
    };

    let limit = minimum + local_threshold_ms as f64;
    servers.into_iter()
           .filter(|server| server.round_trip_time.unwrap_or(0.0) <= limit)
           .collect()
}

fn servers_of_types<'a>(description: &'a TopologyDescription,
                        types: &[ServerType]) -> Vec<&'a ServerDescription> {
    description.servers
               .values()
               .filter(|server| types.contains(&server.server_type))
               .collect()
}

fn known_servers(description: &TopologyDescription) -> Vec<&ServerDescription> {
    description.servers
               .values()
               .filter(|server| {
                   server.server_type != ServerType::Unknown &&
                   server.server_type != ServerType::PossiblePrimary
               })
               .collect()
}

// A server matches a tag set when its tags are a superset of it.
fn matches_tag_set(server: &ServerDescription, tag_set: &BTreeMap<String, String>) -> bool {
    tag_set.iter().all(|(key, value)| server.tags.get(key) == Some(value))
}

/// Applies tag sets in order, stopping at the first one any server matches.
/// An empty list of tag sets matches every server.
fn filter_by_tag_sets<'a>(servers: Vec<&'a ServerDescription>,
                          tag_sets: &[BTreeMap<String, String>]) -> Vec<&'a ServerDescription> {
    if tag_sets.is_empty() {
        return servers;
    }

    for tag_set in tag_sets {
        let matching: Vec<&ServerDescription> = servers.iter()
            .cloned()
            .filter(|server| matches_tag_set(server, tag_set))
            .collect();

        if !matching.is_empty() {
            return matching;
        }
    }

    Vec::new()
}
