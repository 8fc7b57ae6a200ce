//! Integration tests for leader election.

mod common;

use std::time::Duration;

use common::{spawn_cluster, spawn_cluster_with, wait_for_common_term, wait_for_master};
use docweave::{ElectionMode, Phase};

/// A 3-node Bully cluster converges on the highest node id.
#[tokio::test]
async fn bully_elects_highest_id() {
    let nodes = spawn_cluster(3).await;

    let master = wait_for_master(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should elect a master within 10s");

    assert_eq!(master, "node-3");
    assert!(nodes[2].is_coordinator());
    for n in &nodes[..2] {
        assert_eq!(n.node.coordination_status().phase, Phase::Idle);
    }

    let term = wait_for_common_term(&nodes, Duration::from_secs(5))
        .await
        .expect("every node should settle on the coordinator's term");
    assert!(term >= 1);
    assert_eq!(nodes[2].node.coordination_status().term, term);
}

/// Losing the master triggers a new round among the survivors.
#[tokio::test]
async fn bully_reelects_after_master_dies() {
    let nodes = spawn_cluster(3).await;

    let master = wait_for_master(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should elect a master within 10s");
    assert_eq!(master, "node-3");
    let old_term = nodes[0].node.coordination_status().term;

    nodes[2].node.shutdown().await.unwrap();

    let survivors = &nodes[..2];
    let master = wait_for_master(survivors, Duration::from_secs(10))
        .await
        .expect("survivors should elect a new master within 10s");
    assert_eq!(master, "node-2");
    assert!(survivors[0].node.coordination_status().term > old_term);
}

/// An explicit election resolves to the same master at a newer term.
#[tokio::test]
async fn start_election_returns_outcome() {
    let nodes = spawn_cluster(3).await;

    wait_for_master(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should elect a master within 10s");
    let before = nodes[0].node.coordination_status().term;

    let outcome = nodes[0]
        .node
        .start_election("operator request")
        .await
        .expect("election should resolve");

    assert_eq!(outcome.leader, "node-3");
    assert!(outcome.term > before);

    let master = wait_for_master(&nodes, Duration::from_secs(5)).await;
    assert_eq!(master.as_deref(), Some("node-3"));
}

/// A configured initial master is used without waiting for a round.
#[tokio::test]
async fn initial_master_is_seeded() {
    let nodes = spawn_cluster_with(2, |config| {
        config.initial_master = Some("node-1".to_string());
    })
    .await;

    assert_eq!(nodes[0].master().as_deref(), Some("node-1"));
    assert!(nodes[0].is_coordinator());
    assert_eq!(nodes[1].master().as_deref(), Some("node-1"));
    assert!(!nodes[1].is_coordinator());
}

/// Nodes that cannot be master never win.
#[tokio::test]
async fn ineligible_nodes_are_skipped() {
    let nodes = spawn_cluster_with(3, |config| {
        if config.node_id == "node-3" {
            config.can_be_master = false;
        }
        for peer in &mut config.discovery.peers {
            peer.can_be_master = peer.node_id != "node-3";
        }
    })
    .await;

    let master = wait_for_master(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should elect a master within 10s");
    assert_eq!(master, "node-2");
}

/// Proof-of-work mode converges on exactly one master.
#[tokio::test]
async fn proof_of_work_elects_one_master() {
    let nodes = spawn_cluster_with(3, |config| {
        config.election.mode = ElectionMode::ProofOfWork;
        config.election.pow_difficulty = 8;
    })
    .await;

    let master = wait_for_master(&nodes, Duration::from_secs(15))
        .await
        .expect("cluster should elect a master within 15s");

    let coordinator = nodes
        .iter()
        .find(|n| n.is_coordinator())
        .expect("one node should be coordinator");
    assert_eq!(coordinator.node.node_id(), master);

    let term = wait_for_common_term(&nodes, Duration::from_secs(5))
        .await
        .expect("every node should settle on the winning claim's term");
    assert!(term >= 1);
    for n in &nodes {
        assert_eq!(n.master().as_deref(), Some(master.as_str()));
    }
}
