//! Helpers for driving the topology state machine without live servers:
//! hello replies are built as documents, parsed the way the monitor parses
//! them, and folded directly.
use bson::Document;
use bson::oid::ObjectId;

use mongodb_topology::{ClientOptions, Topology};
use mongodb_topology::apm::Listener;
use mongodb_topology::connstring::{self, Host};
use mongodb_topology::stream::StreamConnector;
use mongodb_topology::topology::TopologyDescription;
use mongodb_topology::topology::monitor::HelloResult;
use mongodb_topology::topology::server::ServerDescription;

use std::sync::Arc;

pub fn host(address: &str) -> Host {
    connstring::parse_host(address).unwrap()
}

/// An ObjectId whose ordering is determined by the single byte given.
pub fn election_id(rank: u8) -> ObjectId {
    let mut bytes = [0u8; 12];
    bytes[11] = rank;
    ObjectId::with_bytes(bytes)
}

/// Parses a hello reply document and builds the server description a
/// monitor would have produced for it.
pub fn description_from(address: &str, reply: Document) -> ServerDescription {
    let hello = HelloResult::new(reply).unwrap();
    ServerDescription::from_hello(host(address), hello, Some(5.0))
}

pub fn options(seeds: &[&str], replica_set: Option<&str>) -> ClientOptions {
    let mut options = ClientOptions::new(seeds.iter().map(|seed| host(seed)).collect());
    options.replica_set = replica_set.map(|name| name.to_owned());
    options.stream_connector = StreamConnector::Mock;
    options
}

/// An initial description seeded the way a new topology seeds itself.
pub fn seeded(seeds: &[&str], replica_set: Option<&str>) -> TopologyDescription {
    TopologyDescription::from_options(&options(seeds, replica_set)).unwrap()
}

/// A full topology with no background monitoring, for tests that need
/// server records and pools as well as descriptions.
pub fn mock_topology(seeds: &[&str], replica_set: Option<&str>) -> Topology {
    Topology::new_without_monitors(options(seeds, replica_set), Arc::new(Listener::new()))
        .unwrap()
}

pub fn standalone_reply() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "minWireVersion": 6,
        "maxWireVersion": 17
    }
}

pub fn mongos_reply() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "msg": "isdbgrid",
        "minWireVersion": 6,
        "maxWireVersion": 17
    }
}

pub fn primary_reply(set_name: &str, hosts: &[&str], set_version: i64,
                     election_rank: u8) -> Document {
    let mut reply = doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "setName": set_name,
        "setVersion": set_version,
        "minWireVersion": 6,
        "maxWireVersion": 17
    };
    reply.insert("electionId".to_owned(), election_id(election_rank));
    reply.insert("hosts".to_owned(),
                 hosts.iter().map(|h| h.to_string()).collect::<Vec<String>>());
    reply
}

pub fn secondary_reply(set_name: &str, hosts: &[&str], primary: Option<&str>) -> Document {
    let mut reply = doc! {
        "ok": 1,
        "isWritablePrimary": false,
        "secondary": true,
        "setName": set_name,
        "minWireVersion": 6,
        "maxWireVersion": 17
    };
    reply.insert("hosts".to_owned(),
                 hosts.iter().map(|h| h.to_string()).collect::<Vec<String>>());
    if let Some(primary) = primary {
        reply.insert("primary".to_owned(), primary.to_string());
    }
    reply
}

/// Asserts the single-primary invariant on a description.
pub fn assert_at_most_one_primary(description: &TopologyDescription) {
    use mongodb_topology::topology::server::ServerType;

    let primaries = description.servers
        .values()
        .filter(|server| server.server_type == ServerType::RSPrimary)
        .count();
    assert!(primaries <= 1, "found {} primaries in one description", primaries);
}
