use mongodb_topology::{Error, ReadMode, ReadPreference, SelectionCriterion};
use mongodb_topology::topology::{TopologyDescription, select};
use mongodb_topology::topology::server::ServerType;

use sdam::framework::{description_from, host, mock_topology, mongos_reply, primary_reply,
                      secondary_reply, seeded, standalone_reply};

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

fn replica_set() -> TopologyDescription {
    let hosts = ["a:27017", "b:27017", "c:27017"];
    let mut secondary_b = secondary_reply("rs0", &hosts, Some("a:27017"));
    secondary_b.insert("tags".to_owned(), doc! { "dc": "ny" });
    let mut secondary_c = secondary_reply("rs0", &hosts, Some("a:27017"));
    secondary_c.insert("tags".to_owned(), doc! { "dc": "sf" });

    seeded(&hosts, None)
        .update(description_from("a:27017", primary_reply("rs0", &hosts, 1, 1)))
        .update(description_from("b:27017", secondary_b))
        .update(description_from("c:27017", secondary_c))
}

fn preference(mode: ReadMode) -> ReadPreference {
    ReadPreference::new(mode, None)
}

fn tagged(mode: ReadMode, tag_sets: Vec<Vec<(&str, &str)>>) -> ReadPreference {
    let sets = tag_sets.into_iter()
        .map(|pairs| {
            pairs.into_iter()
                 .map(|(key, value)| (key.to_owned(), value.to_owned()))
                 .collect::<BTreeMap<String, String>>()
        })
        .collect();
    ReadPreference::new(mode, Some(sets))
}

fn addresses(servers: Vec<&mongodb_topology::topology::server::ServerDescription>)
             -> Vec<String> {
    let mut named: Vec<String> = servers.into_iter()
        .map(|server| format!("{}", server.address))
        .collect();
    named.sort();
    named
}

#[test]
fn writable_selects_the_primary() {
    let description = replica_set();
    let writable = select::writable_servers(&description);

    assert_eq!(vec!["a:27017"], addresses(writable));
}

#[test]
fn writable_finds_nothing_without_a_primary() {
    let hosts = ["a:27017", "b:27017"];
    let description = seeded(&hosts, None)
        .update(description_from("b:27017", secondary_reply("rs0", &hosts, None)));

    assert!(select::writable_servers(&description).is_empty());
}

#[test]
fn writable_on_sharded_selects_all_routers() {
    let description = seeded(&["a:27017", "b:27017"], None)
        .update(description_from("a:27017", mongos_reply()))
        .update(description_from("b:27017", mongos_reply()));

    assert_eq!(vec!["a:27017", "b:27017"], addresses(select::writable_servers(&description)));
}

#[test]
fn secondary_mode_excludes_the_primary() {
    let description = replica_set();
    let readable = select::readable_servers(&description, &preference(ReadMode::Secondary));

    assert_eq!(vec!["b:27017", "c:27017"], addresses(readable));
}

#[test]
fn secondary_preferred_falls_back_to_the_primary() {
    let hosts = ["a:27017", "b:27017"];
    // A primary and an arbiter; no secondaries at all.
    let mut arbiter = doc! {
        "ok": 1,
        "isWritablePrimary": false,
        "arbiterOnly": true,
        "setName": "rs0",
        "minWireVersion": 6,
        "maxWireVersion": 17
    };
    arbiter.insert("hosts".to_owned(), vec!["a:27017".to_owned(), "b:27017".to_owned()]);

    let description = seeded(&hosts, None)
        .update(description_from("a:27017", primary_reply("rs0", &hosts, 1, 1)))
        .update(description_from("b:27017", arbiter));

    let readable = select::readable_servers(
        &description, &preference(ReadMode::SecondaryPreferred));

    assert_eq!(vec!["a:27017"], addresses(readable));
}

#[test]
fn primary_preferred_falls_back_to_secondaries() {
    let hosts = ["a:27017", "b:27017"];
    let description = seeded(&hosts, None)
        .update(description_from("b:27017", secondary_reply("rs0", &hosts, None)));

    let readable = select::readable_servers(
        &description, &preference(ReadMode::PrimaryPreferred));

    assert_eq!(vec!["b:27017"], addresses(readable));
}

#[test]
fn first_matching_tag_set_wins() {
    let description = replica_set();

    let readable = select::readable_servers(
        &description,
        &tagged(ReadMode::Secondary, vec![vec![("dc", "chicago")], vec![("dc", "sf")]]));

    assert_eq!(vec!["c:27017"], addresses(readable));
}

#[test]
fn unmatched_tag_sets_select_nothing() {
    let description = replica_set();

    let readable = select::readable_servers(
        &description, &tagged(ReadMode::Secondary, vec![vec![("dc", "chicago")]]));

    assert!(readable.is_empty());
}

#[test]
fn latency_window_keeps_nearby_servers() {
    let mut description = replica_set();

    {
        let fast = description.servers.get_mut(&host("a:27017")).unwrap();
        fast.round_trip_time = Some(10.0);
    }
    {
        let near = description.servers.get_mut(&host("b:27017")).unwrap();
        near.round_trip_time = Some(20.0);
    }
    {
        let far = description.servers.get_mut(&host("c:27017")).unwrap();
        far.round_trip_time = Some(40.0);
    }

    let nearest = select::readable_servers(&description, &preference(ReadMode::Nearest));
    let windowed = select::within_latency_window(nearest, 15);

    assert_eq!(vec!["a:27017", "b:27017"], addresses(windowed));
}

#[test]
fn latency_window_of_empty_candidates_is_empty() {
    assert!(select::within_latency_window(Vec::new(), 15).is_empty());
}

#[test]
fn selection_timeout_reports_the_topology() {
    let topology = mock_topology(&["a:27017"], None);
    let started = Instant::now();

    let result = topology.select_server(&SelectionCriterion::Writable,
                                        Duration::from_millis(50));

    assert!(started.elapsed() >= Duration::from_millis(50));
    match result {
        Err(Error::SelectionTimeout { criterion, topology, elapsed_ms }) => {
            assert!(criterion.contains("writable"), "criterion: {}", criterion);
            assert!(topology.contains("a:27017"), "topology: {}", topology);
            assert!(elapsed_ms >= 50);
        }
        other => panic!("expected a selection timeout, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn incompatible_topology_fails_without_waiting() {
    let topology = mock_topology(&["a:27017"], None);

    let mut reply = standalone_reply();
    reply.insert("minWireVersion".to_owned(), 0);
    reply.insert("maxWireVersion".to_owned(), 2);
    topology.process_server_description(description_from("a:27017", reply));

    let started = Instant::now();
    let result = topology.select_server(&SelectionCriterion::Writable,
                                        Duration::from_secs(30));

    assert!(started.elapsed() < Duration::from_secs(5));
    match result {
        Err(Error::CompatibilityError(message)) => {
            assert!(message.contains("a:27017"), "message: {}", message);
        }
        other => panic!("expected a compatibility error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn waiting_selection_resolves_on_a_qualifying_update() {
    let hosts = ["a:27017", "b:27017"];
    let topology = mock_topology(&hosts, Some("rs0"));
    let (sender, receiver) = mpsc::channel();

    let waiter = topology.clone();
    let handle = thread::spawn(move || {
        let result = waiter.select_server(&SelectionCriterion::Writable,
                                          Duration::from_secs(10));
        sender.send(result.is_ok()).unwrap();
    });

    thread::sleep(Duration::from_millis(100));
    topology.process_server_description(description_from(
        "a:27017", primary_reply("rs0", &hosts, 1, 1)));

    let resolved = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(resolved);
    handle.join().unwrap();
}

#[test]
fn selected_server_exposes_its_description() {
    let hosts = ["a:27017"];
    let topology = mock_topology(&hosts, None);
    topology.process_server_description(description_from(
        "a:27017", primary_reply("rs0", &hosts, 1, 1)));

    let server = topology.select_server(&SelectionCriterion::Writable,
                                        Duration::from_secs(1)).unwrap();

    assert_eq!(&host("a:27017"), server.host());
    assert_eq!(ServerType::RSPrimary, server.description().server_type);
}
