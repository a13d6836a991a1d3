use bson::Bson;

use mongodb_topology::Error;
use mongodb_topology::topology::TopologyType;
use mongodb_topology::topology::monitor::HelloResult;
use mongodb_topology::topology::server::{ServerDescription, ServerType, TopologyVersion};

use super::framework::{assert_at_most_one_primary, description_from, election_id, host,
                       mock_topology, primary_reply, secondary_reply, seeded};

#[test]
fn primary_discovery_sets_membership() {
    let description = seeded(&["a:27017"], None);

    let updated = description.update(description_from(
        "a:27017", primary_reply("rs0", &["a:27017", "b:27017", "c:27017"], 1, 2)));

    assert_eq!(TopologyType::ReplicaSetWithPrimary, updated.topology_type);
    assert_eq!(Some("rs0".to_owned()), updated.set_name);
    assert_eq!(3, updated.servers.len());
    assert_eq!(ServerType::RSPrimary,
               updated.servers.get(&host("a:27017")).unwrap().server_type);
    assert_eq!(ServerType::Unknown,
               updated.servers.get(&host("b:27017")).unwrap().server_type);
    assert_at_most_one_primary(&updated);
}

#[test]
fn stale_primary_claim_is_downgraded() {
    let hosts = ["a:27017", "b:27017", "c:27017"];
    let description = seeded(&hosts, None)
        .update(description_from("a:27017", primary_reply("rs0", &hosts, 1, 2)));

    // An older election id at the same set version loses.
    let updated = description.update(
        description_from("b:27017", primary_reply("rs0", &hosts, 1, 1)));

    assert_eq!(TopologyType::ReplicaSetWithPrimary, updated.topology_type);
    assert_eq!(ServerType::RSPrimary,
               updated.servers.get(&host("a:27017")).unwrap().server_type);
    assert_eq!(ServerType::Unknown,
               updated.servers.get(&host("b:27017")).unwrap().server_type);
    assert_eq!(Some(election_id(2)), updated.max_election_id);
    assert_at_most_one_primary(&updated);
}

#[test]
fn newer_primary_demotes_the_old_one() {
    let hosts = ["a:27017", "b:27017", "c:27017"];
    let description = seeded(&hosts, None)
        .update(description_from("a:27017", primary_reply("rs0", &hosts, 1, 1)));

    let updated = description.update(
        description_from("b:27017", primary_reply("rs0", &hosts, 2, 2)));

    assert_eq!(ServerType::RSPrimary,
               updated.servers.get(&host("b:27017")).unwrap().server_type);
    assert_eq!(ServerType::Unknown,
               updated.servers.get(&host("a:27017")).unwrap().server_type);
    assert_eq!(Some(2), updated.max_set_version);
    assert_at_most_one_primary(&updated);
}

#[test]
fn primary_member_list_is_authoritative() {
    let description = seeded(&["a:27017", "b:27017", "c:27017"], None);

    // The primary no longer lists c, but does introduce d.
    let updated = description.update(description_from(
        "a:27017", primary_reply("rs0", &["a:27017", "b:27017", "d:27017"], 1, 1)));

    assert!(!updated.servers.contains_key(&host("c:27017")));
    assert_eq!(ServerType::Unknown,
               updated.servers.get(&host("d:27017")).unwrap().server_type);
    assert_eq!(3, updated.servers.len());
}

#[test]
fn secondary_without_primary_adds_but_never_removes() {
    let description = seeded(&["a:27017", "b:27017"], None);

    let updated = description.update(description_from(
        "b:27017",
        secondary_reply("rs0", &["b:27017", "c:27017"], Some("a:27017"))));

    assert_eq!(TopologyType::ReplicaSetNoPrimary, updated.topology_type);
    // a is not in b's host list, but a non-primary cannot remove members.
    assert!(updated.servers.contains_key(&host("a:27017")));
    assert!(updated.servers.contains_key(&host("c:27017")));
    // b's claimed primary is marked for priority monitoring.
    assert_eq!(ServerType::PossiblePrimary,
               updated.servers.get(&host("a:27017")).unwrap().server_type);
}

#[test]
fn wrong_set_name_removes_the_server() {
    let description = seeded(&["a:27017", "b:27017"], Some("rs0"));

    let updated = description.update(description_from(
        "b:27017", secondary_reply("rs1", &["b:27017"], None)));

    assert!(!updated.servers.contains_key(&host("b:27017")));
    assert!(updated.servers.contains_key(&host("a:27017")));
}

#[test]
fn heartbeat_failure_marks_unknown_without_removal() {
    let hosts = ["a:27017", "b:27017", "c:27017"];
    let description = seeded(&hosts, None)
        .update(description_from("a:27017", primary_reply("rs0", &hosts, 1, 1)));

    let failed = description.update(ServerDescription::from_error(
        host("a:27017"),
        Error::OperationError("connection refused".to_owned())));

    // Losing the primary degrades the type but never the membership.
    assert_eq!(TopologyType::ReplicaSetNoPrimary, failed.topology_type);
    assert_eq!(3, failed.servers.len());
    let server = failed.servers.get(&host("a:27017")).unwrap();
    assert_eq!(ServerType::Unknown, server.server_type);
    assert!(server.error.is_some());
}

#[test]
fn me_mismatch_removes_the_server() {
    let description = seeded(&["a:27017", "b:27017"], None);

    let mut reply = secondary_reply("rs0", &["a:27017", "b:27017"], None);
    reply.insert("me".to_owned(), "elsewhere:27017");

    let updated = description.update(description_from("b:27017", reply));

    assert!(!updated.servers.contains_key(&host("b:27017")));
}

#[test]
fn session_timeout_is_the_minimum_over_data_bearing_servers() {
    let hosts = ["a:27017", "b:27017"];

    let mut primary = primary_reply("rs0", &hosts, 1, 1);
    primary.insert("logicalSessionTimeoutMinutes".to_owned(), 30);

    let mut secondary = secondary_reply("rs0", &hosts, Some("a:27017"));
    secondary.insert("logicalSessionTimeoutMinutes".to_owned(), 20);

    let description = seeded(&hosts, None)
        .update(description_from("a:27017", primary))
        .update(description_from("b:27017", secondary));

    assert_eq!(Some(20), description.logical_session_timeout_minutes);

    // A data-bearing server without the field clears the bound.
    let silent = secondary_reply("rs0", &hosts, Some("a:27017"));
    let updated = description.update(description_from("b:27017", silent));
    assert_eq!(None, updated.logical_session_timeout_minutes);
}

fn with_topology_version(mut reply: bson::Document, counter: i64) -> bson::Document {
    reply.insert("topologyVersion".to_owned(),
                 Bson::Document(doc! {
                     "processId": election_id(9),
                     "counter": counter
                 }));
    reply
}

#[test]
fn stale_topology_version_is_discarded() {
    let hosts = ["a:27017", "b:27017"];
    let topology = mock_topology(&hosts, None);

    let fresh = with_topology_version(primary_reply("rs0", &hosts, 1, 1), 5);
    topology.process_server_description(description_from("a:27017", fresh));

    let description = topology.description().unwrap();
    assert_eq!(TopologyType::ReplicaSetWithPrimary, description.topology_type);

    // A reply with an older counter from the same process arrives late; it
    // must not regress the recorded state.
    let stale = with_topology_version(
        secondary_reply("rs0", &hosts, None), 3);
    topology.process_server_description(description_from("a:27017", stale));

    let unchanged = topology.description().unwrap();
    assert_eq!(TopologyType::ReplicaSetWithPrimary, unchanged.topology_type);
    assert_eq!(ServerType::RSPrimary,
               unchanged.servers.get(&host("a:27017")).unwrap().server_type);
    assert_eq!(Some(TopologyVersion { process_id: election_id(9), counter: 5 }),
               unchanged.servers.get(&host("a:27017")).unwrap().topology_version);
}

#[test]
fn recovery_after_error_is_accepted() {
    let hosts = ["a:27017"];
    let topology = mock_topology(&hosts, None);

    let fresh = with_topology_version(primary_reply("rs0", &hosts, 1, 1), 5);
    topology.process_server_description(description_from("a:27017", fresh));

    topology.process_server_description(ServerDescription::from_error(
        host("a:27017"), Error::OperationError("connection reset".to_owned())));
    assert_eq!(ServerType::Unknown,
               topology.description().unwrap()
                   .servers.get(&host("a:27017")).unwrap().server_type);

    // The server restarts with the same counter; after an error fold the
    // reply must still be accepted.
    let recovered = with_topology_version(primary_reply("rs0", &hosts, 1, 1), 5);
    topology.process_server_description(description_from("a:27017", recovered));
    assert_eq!(ServerType::RSPrimary,
               topology.description().unwrap()
                   .servers.get(&host("a:27017")).unwrap().server_type);
}

#[test]
fn monitor_error_clears_the_pool_in_the_same_update() {
    let hosts = ["a:27017", "b:27017"];
    let topology = mock_topology(&hosts, None);

    topology.process_server_description(description_from(
        "a:27017", primary_reply("rs0", &hosts, 1, 1)));

    let pool = topology.server(&host("a:27017")).unwrap().pool();
    assert_eq!(0, pool.generation());

    topology.process_server_description(ServerDescription::from_error(
        host("a:27017"), Error::OperationError("network error".to_owned())));

    assert_eq!(1, pool.generation());
}

#[test]
fn removed_server_update_is_ignored() {
    let topology = mock_topology(&["a:27017", "b:27017"], None);

    // The primary's member list drops b entirely.
    topology.process_server_description(description_from(
        "a:27017", primary_reply("rs0", &["a:27017"], 1, 1)));
    assert!(topology.description().unwrap()
        .servers.get(&host("b:27017")).is_none());
    assert!(topology.server(&host("b:27017")).is_none());

    // A slow heartbeat reply from b arrives after its removal.
    topology.process_server_description(description_from(
        "b:27017", secondary_reply("rs0", &["a:27017", "b:27017"], None)));

    let description = topology.description().unwrap();
    assert_eq!(1, description.servers.len());
    assert!(description.servers.get(&host("b:27017")).is_none());
}

#[test]
fn hello_reply_parsing_covers_replica_set_fields() {
    let mut reply = primary_reply("rs0", &["a:27017", "b:27017"], 7, 3);
    reply.insert("logicalSessionTimeoutMinutes".to_owned(), 30);
    reply.insert("tags".to_owned(), Bson::Document(doc! { "dc": "ny" }));

    let hello = HelloResult::new(reply).unwrap();

    assert!(hello.ok);
    assert!(hello.is_writable_primary);
    assert_eq!(Some("rs0".to_owned()), hello.set_name);
    assert_eq!(Some(7), hello.set_version);
    assert_eq!(Some(election_id(3)), hello.election_id);
    assert_eq!(vec![host("a:27017"), host("b:27017")], hello.hosts);
    assert_eq!(Some(30), hello.logical_session_timeout_minutes);
    assert_eq!(Some(&"ny".to_owned()), hello.tags.get("dc"));
}
