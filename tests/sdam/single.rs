use mongodb_topology::topology::TopologyType;
use mongodb_topology::topology::server::{ServerDescription, ServerType};

use super::framework::{description_from, host, seeded, standalone_reply};

#[test]
fn standalone_discovery() {
    let description = seeded(&["a:27017"], None);
    assert_eq!(TopologyType::Unknown, description.topology_type);

    let updated = description.update(description_from("a:27017", standalone_reply()));

    assert_eq!(TopologyType::Single, updated.topology_type);
    assert_eq!(1, updated.servers.len());
    assert_eq!(ServerType::Standalone,
               updated.servers.get(&host("a:27017")).unwrap().server_type);
}

#[test]
fn standalone_among_multiple_seeds_is_removed() {
    let description = seeded(&["a:27017", "b:27017"], None);

    let updated = description.update(description_from("a:27017", standalone_reply()));

    assert_eq!(TopologyType::Unknown, updated.topology_type);
    assert!(!updated.servers.contains_key(&host("a:27017")));
    assert!(updated.servers.contains_key(&host("b:27017")));
}

#[test]
fn single_topology_records_later_observations() {
    let description = seeded(&["a:27017"], None)
        .update(description_from("a:27017", standalone_reply()));

    // A check failure marks the server Unknown but the topology stays
    // Single with the same membership.
    let error = mongodb_topology::Error::OperationError("boom".to_owned());
    let failed = description.update(ServerDescription::from_error(host("a:27017"), error));

    assert_eq!(TopologyType::Single, failed.topology_type);
    let server = failed.servers.get(&host("a:27017")).unwrap();
    assert_eq!(ServerType::Unknown, server.server_type);
    assert!(server.error.is_some());
}

#[test]
fn fold_is_idempotent() {
    let description = seeded(&["a:27017", "b:27017"], None);
    let observed = description_from("a:27017", standalone_reply());

    let once = description.update(observed.clone());
    let twice = once.update(observed);

    assert_eq!(once.topology_type, twice.topology_type);
    assert_eq!(once.set_name, twice.set_name);
    let once_members: Vec<_> = once.servers.keys().cloned().collect();
    let twice_members: Vec<_> = twice.servers.keys().cloned().collect();
    assert_eq!(once_members, twice_members);
}

#[test]
fn update_for_unknown_address_is_ignored() {
    let description = seeded(&["a:27017"], None);

    let updated = description.update(description_from("b:27017", standalone_reply()));

    assert_eq!(TopologyType::Unknown, updated.topology_type);
    assert_eq!(1, updated.servers.len());
    assert!(!updated.servers.contains_key(&host("b:27017")));
}

#[test]
fn disjoint_wire_versions_flag_incompatibility() {
    let description = seeded(&["a:27017"], None);

    let mut reply = standalone_reply();
    reply.insert("minWireVersion".to_owned(), 0);
    reply.insert("maxWireVersion".to_owned(), 2);

    let updated = description.update(description_from("a:27017", reply));

    assert!(!updated.compatible);
    let message = updated.compatibility_error.unwrap();
    assert!(message.contains("a:27017"), "unexpected message: {}", message);
}

#[test]
fn compatibility_recovers_with_the_server() {
    let description = seeded(&["a:27017"], None);

    let mut stale = standalone_reply();
    stale.insert("minWireVersion".to_owned(), 0);
    stale.insert("maxWireVersion".to_owned(), 2);

    let incompatible = description.update(description_from("a:27017", stale));
    assert!(!incompatible.compatible);

    let recovered = incompatible.update(description_from("a:27017", standalone_reply()));
    assert!(recovered.compatible);
    assert!(recovered.compatibility_error.is_none());
}
